// Core modules
pub mod types;
pub mod config;
pub mod queue;
pub mod registry;

// Support modules
pub mod journal;
pub mod compression;

// Re-export main types for convenience
pub use types::{MessageRef, Position, QueuedMessage, current_timestamp_ms};
pub use config::StorageConfig;
pub use queue::{DurableQueue, PersistableQueue, PositionRegression, Queue};
pub use registry::{QueueRegistry, SharedQueue};
pub use journal::{Journal, JournalEntry};
