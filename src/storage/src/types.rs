use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Position of a message in a queue's enqueue sequence.
///
/// Positions are 1-based and strictly increasing for the lifetime of a
/// queue. `Position::ZERO` means "before the first message" and is what a
/// brand-new mirror reports as its low-water-mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Position(pub u64);

impl Position {
    pub const ZERO: Position = Position(0);

    pub fn next(self) -> Position {
        Position(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message held in a queue, tagged with its enqueue position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub position: Position,
    pub body: String,
    /// Unix ms
    pub enqueued_at: u64,
}

impl QueuedMessage {
    pub fn new(position: Position, body: String) -> Self {
        QueuedMessage {
            position,
            body,
            enqueued_at: current_timestamp_ms(),
        }
    }

    pub fn message_ref(&self, queue: &str) -> MessageRef {
        MessageRef {
            queue: queue.to_string(),
            position: self.position,
        }
    }
}

/// Handle passed to the persistence layer once a dequeue has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub queue: String,
    pub position: Position,
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.queue, self.position)
    }
}

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
