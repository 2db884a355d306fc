use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use log::{info, warn};

use crate::config::{StorageConfig, JOURNAL_EXTENSION};
use crate::journal::{self, Journal, JournalEntry};
use crate::queue::{DurableQueue, Queue};

/// Queue handle shared between client sessions and the replication layer.
///
/// The mutex also serializes each queue's enqueue sequence: a caller that
/// holds it owns the next position until it lets go.
pub type SharedQueue = Arc<Mutex<DurableQueue>>;

/// Registry of all queues on this broker.
///
/// Queues are created on first declaration. With journalling enabled each
/// queue is backed by its own journal file which is replayed when the
/// registry is opened.
#[derive(Clone)]
pub struct QueueRegistry {
    config: Arc<StorageConfig>,
    queues: Arc<RwLock<HashMap<String, SharedQueue>>>,
}

impl QueueRegistry {
    /// Create an empty in-memory registry.
    pub fn new() -> Self {
        info!("Initializing in-memory queue registry");
        QueueRegistry {
            config: Arc::new(StorageConfig::in_memory()),
            queues: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open a registry, replaying any journals found in the configured directory.
    pub fn with_config(config: StorageConfig) -> io::Result<Self> {
        let mut queues = HashMap::new();

        if let Some(dir) = config.journal_dir.as_ref() {
            std::fs::create_dir_all(dir)?;
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXTENSION) {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                    continue;
                };
                let queue = replay(&name, &journal::read_entries(&path)?);
                info!("Recovered queue {} with {} messages (tail {})", name, queue.len(), queue.tail());
                let journal = Journal::open(&path)?;
                queues.insert(name, Arc::new(Mutex::new(DurableQueue::new(queue, Some(journal)))));
            }
            info!("Queue journals under {:?}, {} queues recovered", dir, queues.len());
        } else {
            info!("Running in memory-only mode (no persistence)");
        }

        Ok(QueueRegistry {
            config: Arc::new(config),
            queues: Arc::new(RwLock::new(queues)),
        })
    }

    /// Declare a queue, creating it if it doesn't exist.
    ///
    /// Returns the queue and whether it was newly created.
    pub async fn declare(&self, name: &str) -> io::Result<(SharedQueue, bool)> {
        validate_name(name)?;

        let mut queues = self.queues.write().await;
        if let Some(existing) = queues.get(name) {
            return Ok((existing.clone(), false));
        }

        let journal = match self.config.journal_path(name) {
            Some(path) => Some(Journal::open(path)?),
            None => None,
        };
        let queue = Arc::new(Mutex::new(DurableQueue::new(Queue::new(name), journal)));
        queues.insert(name.to_string(), queue.clone());
        info!("Queue {} declared", name);
        Ok((queue, true))
    }

    pub async fn get(&self, name: &str) -> Option<SharedQueue> {
        self.queues.read().await.get(name).cloned()
    }

    /// Delete a queue and its journal. Returns `false` if it didn't exist.
    pub async fn delete(&self, name: &str) -> io::Result<bool> {
        let removed = self.queues.write().await.remove(name);
        let Some(queue) = removed else {
            return Ok(false);
        };

        match Arc::try_unwrap(queue) {
            Ok(mutex) => mutex.into_inner().destroy()?,
            Err(shared) => {
                // Still referenced by an in-flight operation; drop the file directly.
                warn!("Queue {} deleted while in use", name);
                if let Some(path) = self.config.journal_path(name) {
                    if path.exists() {
                        std::fs::remove_file(path)?;
                    }
                }
                drop(shared);
            }
        }
        Ok(true)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn queue_count(&self) -> usize {
        self.queues.read().await.len()
    }

    /// Total messages currently held across all queues
    pub async fn message_count(&self) -> usize {
        let queues: Vec<SharedQueue> = self.queues.read().await.values().cloned().collect();
        let mut total = 0;
        for queue in queues {
            total += queue.lock().await.len();
        }
        total
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Rebuild queue contents from journal entries.
fn replay(name: &str, entries: &[JournalEntry]) -> Queue {
    let mut queue = Queue::new(name);
    for entry in entries {
        match entry {
            JournalEntry::Enqueue { position, body, .. } => {
                if let Err(e) = queue.enqueue_at(*position, body.clone()) {
                    warn!("Ignoring journal record: {}", e);
                }
            }
            JournalEntry::Dequeue { position, .. } => {
                queue.remove(*position);
            }
        }
    }
    queue
}

fn validate_name(name: &str) -> io::Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 255
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid queue name: '{}'", name),
        ))
    }
}
