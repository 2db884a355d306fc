//! Queue consumer factories.
//!
//! A session names the kind of consumer it wants when it attaches to a
//! queue; the factory for that kind builds it. The replicating factory is
//! only present once HA is running.

use std::io;

use storage::{DurableQueue, PersistableQueue, Position, QueuedMessage};

use crate::error::AttachError;
use crate::membership::ClusterView;
use crate::subscription::{Attached, ReplicatingSubscription};
use crate::types::{ConsumerKind, MemberId, StartPoint};

pub struct ConsumerRequest<'a> {
    pub queue: &'a DurableQueue,
    /// Backup the stream is for; replicating consumers only
    pub peer: Option<&'a MemberId>,
    pub start: StartPoint,
}

pub enum QueueConsumer {
    Normal(NormalConsumer),
    Replicating(Attached),
}

pub trait QueueConsumerFactory: Send + Sync {
    fn kind(&self) -> ConsumerKind;

    fn create(&self, view: &mut ClusterView, request: ConsumerRequest<'_>) -> Result<QueueConsumer, AttachError>;
}

/// Ordinary client consumer: takes messages off the head of the queue.
#[derive(Debug, Clone)]
pub struct NormalConsumer {
    queue: String,
}

impl NormalConsumer {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The message that would be delivered next
    pub fn next(&self, queue: &DurableQueue) -> Option<QueuedMessage> {
        queue.queue().peek().cloned()
    }

    /// Remove a delivered message and tell the store.
    pub fn acknowledge(&self, queue: &mut DurableQueue, position: Position) -> io::Result<Option<QueuedMessage>> {
        let Some(message) = queue.remove(position) else {
            return Ok(None);
        };
        queue.dequeue_complete(&message.message_ref(&self.queue))?;
        Ok(Some(message))
    }
}

pub struct NormalConsumerFactory;

impl QueueConsumerFactory for NormalConsumerFactory {
    fn kind(&self) -> ConsumerKind {
        ConsumerKind::Normal
    }

    fn create(&self, _view: &mut ClusterView, request: ConsumerRequest<'_>) -> Result<QueueConsumer, AttachError> {
        Ok(QueueConsumer::Normal(NormalConsumer {
            queue: request.queue.name().to_string(),
        }))
    }
}

pub struct ReplicatingConsumerFactory;

impl QueueConsumerFactory for ReplicatingConsumerFactory {
    fn kind(&self) -> ConsumerKind {
        ConsumerKind::Replicating
    }

    fn create(&self, view: &mut ClusterView, request: ConsumerRequest<'_>) -> Result<QueueConsumer, AttachError> {
        let peer = request.peer.ok_or(AttachError::MissingPeer)?;
        let attached = ReplicatingSubscription::attach(view, request.queue, peer, request.start)?;
        Ok(QueueConsumer::Replicating(attached))
    }
}

/// The consumer factories registered with this broker
pub struct ConsumerFactories {
    normal: NormalConsumerFactory,
    replicating: Option<ReplicatingConsumerFactory>,
}

impl ConsumerFactories {
    pub fn new() -> Self {
        ConsumerFactories {
            normal: NormalConsumerFactory,
            replicating: None,
        }
    }

    pub fn register_replication(&mut self) {
        self.replicating = Some(ReplicatingConsumerFactory);
    }

    pub fn select(&self, kind: ConsumerKind) -> Option<&dyn QueueConsumerFactory> {
        match kind {
            ConsumerKind::Normal => Some(&self.normal),
            ConsumerKind::Replicating => self
                .replicating
                .as_ref()
                .map(|f| f as &dyn QueueConsumerFactory),
        }
    }

    pub fn create(
        &self,
        kind: ConsumerKind,
        view: &mut ClusterView,
        request: ConsumerRequest<'_>,
    ) -> Result<QueueConsumer, AttachError> {
        match self.select(kind) {
            Some(factory) => factory.create(view, request),
            None => Err(AttachError::NotPrimary { role: view.local_role() }),
        }
    }
}

impl Default for ConsumerFactories {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn test_replicating_factory_needs_registration() {
        let mut factories = ConsumerFactories::new();
        assert!(factories.select(ConsumerKind::Replicating).is_none());
        factories.register_replication();
        assert_eq!(
            factories.select(ConsumerKind::Replicating).map(|f| f.kind()),
            Some(ConsumerKind::Replicating)
        );
    }

    #[test]
    fn test_replicating_consumer_refused_unless_primary() {
        let mut factories = ConsumerFactories::new();
        factories.register_replication();
        let mut view = ClusterView::new(MemberId::new("a"));
        let peer = MemberId::new("b");
        view.member_joined(&peer);
        let queue = DurableQueue::in_memory("q");

        let request = ConsumerRequest { queue: &queue, peer: Some(&peer), start: StartPoint::Tail };
        assert!(matches!(
            factories.create(ConsumerKind::Replicating, &mut view, request),
            Err(AttachError::NotPrimary { role: Role::Backup })
        ));

        view.set_local_role(Role::Primary);
        let request = ConsumerRequest { queue: &queue, peer: Some(&peer), start: StartPoint::Tail };
        assert!(matches!(
            factories.create(ConsumerKind::Replicating, &mut view, request),
            Ok(QueueConsumer::Replicating(_))
        ));
    }

    #[test]
    fn test_normal_consumer_acknowledge() {
        let factories = ConsumerFactories::new();
        let mut view = ClusterView::new(MemberId::new("a"));
        let mut queue = DurableQueue::in_memory("q");
        queue.enqueue("m".to_string()).unwrap();

        let request = ConsumerRequest { queue: &queue, peer: None, start: StartPoint::Tail };
        let consumer = match factories.create(ConsumerKind::Normal, &mut view, request) {
            Ok(QueueConsumer::Normal(consumer)) => consumer,
            _ => panic!("expected a normal consumer"),
        };

        let next = consumer.next(&queue).unwrap();
        let taken = consumer.acknowledge(&mut queue, next.position).unwrap();
        assert_eq!(taken.map(|m| m.body), Some("m".to_string()));
        assert!(consumer.acknowledge(&mut queue, next.position).unwrap().is_none());
        assert_eq!(queue.dequeue_complete_count(), 1);
    }
}
