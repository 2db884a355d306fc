use std::env;

use storage::StorageConfig;

use crate::error::ServerError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Process settings read from `QUAY_*` environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port of the first member; member `i` listens on `port + i`
    pub port: u16,
    /// 0 disables the HTTP metrics endpoint
    pub metrics_port: u16,
    pub data_dir: String,
    pub persist: bool,
    /// Members started in this process
    pub nodes: usize,
}

fn port_var(name: &str, default: u16) -> Result<u16, ServerError> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u16>()
            .map_err(|e| ServerError::InvalidPort(format!("{}={}: {}", name, value, e))),
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ServerError> {
        let host = env::var("QUAY_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = port_var("QUAY_PORT", DEFAULT_PORT)?;
        let metrics_port = port_var("QUAY_METRICS_PORT", 0)?;
        let data_dir = env::var("QUAY_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
        let persist = env::var("QUAY_PERSIST")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(true);
        let nodes = env::var("QUAY_NODES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1);

        Ok(ServerConfig {
            host,
            port,
            metrics_port,
            data_dir,
            persist,
            nodes,
        })
    }

    pub fn member_port(&self, index: usize) -> Result<u16, ServerError> {
        u16::try_from(self.port as usize + index)
            .map_err(|_| ServerError::InvalidPort(format!("{} + {}", self.port, index)))
    }

    /// Journal directory per member so co-hosted members never share files
    pub fn storage_config(&self, member: &str) -> StorageConfig {
        if self.persist {
            StorageConfig::with_journal(format!("{}/{}", self.data_dir, member))
        } else {
            StorageConfig::in_memory()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            metrics_port: 0,
            data_dir: DEFAULT_DATA_DIR.to_string(),
            persist: true,
            nodes: 1,
        }
    }
}
