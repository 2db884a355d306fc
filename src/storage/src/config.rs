use std::path::{Path, PathBuf};

/// Journal file extension
pub const JOURNAL_EXTENSION: &str = "qjnl";

/// Storage configuration
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Directory holding one journal file per queue; `None` keeps queues in memory only
    pub journal_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Create config with journalling enabled under the given directory
    pub fn with_journal<P: AsRef<Path>>(dir: P) -> Self {
        StorageConfig {
            journal_dir: Some(dir.as_ref().to_path_buf()),
        }
    }

    /// Create config for in-memory only queues
    pub fn in_memory() -> Self {
        StorageConfig { journal_dir: None }
    }

    pub fn is_persistent(&self) -> bool {
        self.journal_dir.is_some()
    }

    /// Journal path for a queue, if journalling is enabled
    pub fn journal_path(&self, queue: &str) -> Option<PathBuf> {
        self.journal_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.{}", queue, JOURNAL_EXTENSION)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_path() {
        let config = StorageConfig::with_journal("/var/lib/quay");
        assert_eq!(
            config.journal_path("orders"),
            Some(PathBuf::from("/var/lib/quay/orders.qjnl"))
        );
        assert!(StorageConfig::in_memory().journal_path("orders").is_none());
    }
}
