use std::collections::VecDeque;
use std::fmt;
use std::io;

use log::{debug, info};

use crate::journal::Journal;
use crate::types::{MessageRef, Position, QueuedMessage};

/// The interface a queue exposes to the persistence layer.
pub trait PersistableQueue: Send {
    fn name(&self) -> &str;

    /// Push any buffered records to durable storage.
    fn flush(&mut self) -> io::Result<()>;

    /// The message has finished being dequeued from the store.
    fn dequeue_complete(&mut self, message: &MessageRef) -> io::Result<()>;
}

/// Error raised when a message is placed at or before the current tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionRegression {
    pub queue: String,
    pub position: Position,
    pub tail: Position,
}

impl fmt::Display for PositionRegression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "position regression on queue {}: got {}, tail is {}",
            self.queue, self.position, self.tail
        )
    }
}

impl std::error::Error for PositionRegression {}

impl From<PositionRegression> for io::Error {
    fn from(err: PositionRegression) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// In-memory FIFO queue with a monotonic enqueue sequence.
#[derive(Debug, Clone)]
pub struct Queue {
    name: String,
    messages: VecDeque<QueuedMessage>,
    /// Highest position ever assigned; survives dequeues.
    tail: Position,
}

impl Queue {
    pub fn new(name: &str) -> Self {
        Queue {
            name: name.to_string(),
            messages: VecDeque::new(),
            tail: Position::ZERO,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tail(&self) -> Position {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a message at the next position.
    pub fn enqueue(&mut self, body: String) -> QueuedMessage {
        let message = QueuedMessage::new(self.tail.next(), body);
        self.tail = message.position;
        self.messages.push_back(message.clone());
        message
    }

    /// Append a message at an explicit position. Replicas use this so that
    /// their positions match the primary's; gaps are allowed, regressions
    /// are not.
    pub fn enqueue_at(&mut self, position: Position, body: String) -> Result<QueuedMessage, PositionRegression> {
        if position <= self.tail {
            return Err(PositionRegression {
                queue: self.name.clone(),
                position,
                tail: self.tail,
            });
        }
        let message = QueuedMessage::new(position, body);
        self.tail = position;
        self.messages.push_back(message.clone());
        Ok(message)
    }

    pub fn dequeue(&mut self) -> Option<QueuedMessage> {
        self.messages.pop_front()
    }

    /// Remove a specific message wherever it sits in the queue.
    pub fn remove(&mut self, position: Position) -> Option<QueuedMessage> {
        let index = self
            .messages
            .binary_search_by(|m| m.position.cmp(&position))
            .ok()?;
        self.messages.remove(index)
    }

    pub fn peek(&self) -> Option<&QueuedMessage> {
        self.messages.front()
    }

    /// Messages still held with a position strictly greater than `position`.
    pub fn messages_after(&self, position: Position) -> Vec<QueuedMessage> {
        self.messages
            .iter()
            .filter(|m| m.position > position)
            .cloned()
            .collect()
    }

    pub fn contains(&self, position: Position) -> bool {
        self.messages
            .binary_search_by(|m| m.position.cmp(&position))
            .is_ok()
    }
}

/// A queue whose changes are written to a journal before they become visible.
pub struct DurableQueue {
    queue: Queue,
    journal: Option<Journal>,
    dequeues_completed: u64,
}

impl DurableQueue {
    pub fn new(queue: Queue, journal: Option<Journal>) -> Self {
        DurableQueue {
            queue,
            journal,
            dequeues_completed: 0,
        }
    }

    pub fn in_memory(name: &str) -> Self {
        Self::new(Queue::new(name), None)
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn tail(&self) -> Position {
        self.queue.tail()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_journalled(&self) -> bool {
        self.journal.is_some()
    }

    /// Number of `dequeue_complete` calls seen since this queue was opened.
    pub fn dequeue_complete_count(&self) -> u64 {
        self.dequeues_completed
    }

    pub fn enqueue(&mut self, body: String) -> io::Result<QueuedMessage> {
        let position = self.queue.tail().next();
        if let Some(journal) = self.journal.as_mut() {
            journal.log_enqueue(self.queue.name(), position, &body)?;
        }
        Ok(self.queue.enqueue(body))
    }

    pub fn enqueue_at(&mut self, position: Position, body: String) -> io::Result<QueuedMessage> {
        if position <= self.queue.tail() {
            return Err(PositionRegression {
                queue: self.queue.name().to_string(),
                position,
                tail: self.queue.tail(),
            }
            .into());
        }
        if let Some(journal) = self.journal.as_mut() {
            journal.log_enqueue(self.queue.name(), position, &body)?;
        }
        Ok(self.queue.enqueue_at(position, body)?)
    }

    /// Take the head message. The caller reports completion through
    /// [`PersistableQueue::dequeue_complete`] once the removal is final.
    pub fn dequeue(&mut self) -> Option<QueuedMessage> {
        self.queue.dequeue()
    }

    pub fn remove(&mut self, position: Position) -> Option<QueuedMessage> {
        self.queue.remove(position)
    }

    pub fn messages_after(&self, position: Position) -> Vec<QueuedMessage> {
        self.queue.messages_after(position)
    }

    /// Close the journal and delete its file.
    pub fn destroy(mut self) -> io::Result<()> {
        if let Some(journal) = self.journal.take() {
            journal.remove()?;
        }
        info!("Queue {} destroyed", self.queue.name());
        Ok(())
    }
}

impl PersistableQueue for DurableQueue {
    fn name(&self) -> &str {
        self.queue.name()
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.flush(),
            None => Ok(()),
        }
    }

    fn dequeue_complete(&mut self, message: &MessageRef) -> io::Result<()> {
        if let Some(journal) = self.journal.as_mut() {
            journal.log_dequeue(&message.queue, message.position)?;
        }
        self.dequeues_completed += 1;
        debug!("Dequeue complete for {}", message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_assigns_increasing_positions() {
        let mut queue = Queue::new("q");
        let a = queue.enqueue("a".to_string());
        let b = queue.enqueue("b".to_string());
        assert_eq!(a.position, Position(1));
        assert_eq!(b.position, Position(2));
        assert_eq!(queue.tail(), Position(2));
    }

    #[test]
    fn test_tail_survives_dequeue() {
        let mut queue = Queue::new("q");
        queue.enqueue("a".to_string());
        queue.dequeue();
        let b = queue.enqueue("b".to_string());
        assert_eq!(b.position, Position(2));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_enqueue_at_rejects_regression() {
        let mut queue = Queue::new("q");
        queue.enqueue_at(Position(5), "x".to_string()).unwrap();
        let err = queue.enqueue_at(Position(5), "y".to_string()).unwrap_err();
        assert_eq!(err.tail, Position(5));
        assert!(queue.enqueue_at(Position(3), "z".to_string()).is_err());
        assert!(queue.enqueue_at(Position(9), "w".to_string()).is_ok());
    }

    #[test]
    fn test_remove_and_messages_after() {
        let mut queue = Queue::new("q");
        for body in ["a", "b", "c", "d"] {
            queue.enqueue(body.to_string());
        }
        assert_eq!(queue.remove(Position(2)).map(|m| m.body), Some("b".to_string()));
        assert!(queue.remove(Position(2)).is_none());

        let after: Vec<u64> = queue.messages_after(Position(1)).iter().map(|m| m.position.get()).collect();
        assert_eq!(after, vec![3, 4]);
        assert!(queue.contains(Position(4)));
        assert!(!queue.contains(Position(2)));
    }

    #[test]
    fn test_dequeue_complete_is_counted() {
        let mut queue = DurableQueue::in_memory("q");
        let message = queue.enqueue("a".to_string()).unwrap();
        let taken = queue.dequeue().unwrap();
        assert_eq!(taken, message);

        queue.dequeue_complete(&taken.message_ref("q")).unwrap();
        assert_eq!(queue.dequeue_complete_count(), 1);
        assert!(queue.flush().is_ok());
    }
}
