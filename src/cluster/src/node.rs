//! A broker taking part in an HA cluster.
//!
//! The node owns the event loop that drains the transport in delivery
//! order, and the client-facing queue operations. Lock order is always
//! queue, then HA state; neither is held across an unrelated await.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use storage::{PersistableQueue, Position, QueueRegistry, QueuedMessage};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backup::{ApplyError, Mirror};
use crate::config::HaSettings;
use crate::consumer::{ConsumerRequest, QueueConsumer};
use crate::error::{AdmissionError, AttachError, HaError};
use crate::frame::{Announcement, FrameBody, SessionFrame};
use crate::ha_broker::HaBroker;
use crate::management::{HaAttributes, ManagementAgent, ManagementStatus};
use crate::membership::{MemberStatus, ReplicationStream};
use crate::role::Promotion;
use crate::router::{Routed, SessionRouter};
use crate::subscription::ReplicatingSubscription;
use crate::transport::{FrameTransport, TransportEvent};
use crate::types::{ClusterCondition, ConnectionKind, ConsumerKind, MemberId, Role, StartPoint};

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub name: String,
    pub depth: usize,
    pub tail: Position,
}

/// Snapshot of a node for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub member_id: MemberId,
    pub role: Role,
    pub attributes: HaAttributes,
    pub members: Vec<MemberStatus>,
    pub streams: Vec<ReplicationStream>,
    pub mirrors: Vec<Mirror>,
    pub queues: Vec<QueueStatus>,
}

pub struct ClusterNode {
    id: MemberId,
    registry: QueueRegistry,
    ha: HaBroker,
    router: SessionRouter,
    transport: Arc<dyn FrameTransport>,
    conditions: broadcast::Sender<ClusterCondition>,
}

impl ClusterNode {
    pub fn new(
        settings: &HaSettings,
        registry: QueueRegistry,
        transport: Arc<dyn FrameTransport>,
        agent: Option<Arc<ManagementAgent>>,
    ) -> Result<Arc<Self>, HaError> {
        let ha = HaBroker::new(settings, agent)?;
        let (conditions, _) = broadcast::channel(256);

        Ok(Arc::new(ClusterNode {
            id: ha.member_id().clone(),
            registry,
            ha,
            router: SessionRouter::new(),
            transport,
            conditions,
        }))
    }

    pub fn id(&self) -> &MemberId {
        &self.id
    }

    pub fn ha(&self) -> &HaBroker {
        &self.ha
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    pub fn router(&self) -> &SessionRouter {
        &self.router
    }

    pub async fn role(&self) -> Role {
        self.ha.role().await
    }

    /// Conditions needing operator attention, such as losing the primary
    pub fn conditions(&self) -> broadcast::Receiver<ClusterCondition> {
        self.conditions.subscribe()
    }

    /// Join the cluster and start processing delivered frames.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, HaError> {
        if let Some(backup) = self.ha.lock().await.backup.as_mut() {
            backup.rejoined();
        }
        let mut events = self.transport.join(&self.id).await?;
        let node = self.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = node.handle_event(event).await {
                    warn!("Cluster event on {} failed: {}", node.id, e);
                }
            }
            info!("Cluster event loop for {} stopped", node.id);
        });

        self.announce().await?;
        info!("Node {} joined the cluster", self.id);
        Ok(handle)
    }

    /// Leave the cluster; the event loop ends once the transport lets go.
    pub async fn stop(&self) {
        self.transport.leave(&self.id).await;
        info!("Node {} left the cluster", self.id);
    }

    async fn handle_event(&self, event: TransportEvent) -> Result<(), HaError> {
        match event {
            TransportEvent::Membership { member, joined: true } => self.on_member_joined(member).await,
            TransportEvent::Membership { member, joined: false } => self.on_member_departed(member).await,
            TransportEvent::Deliver { from, frame, .. } => match self.router.route(&from, frame).await {
                Routed::Controller(frame) => self.on_control(from, frame).await,
                Routed::Replica(frame) => self.on_replica(frame).await,
                Routed::Session(_) | Routed::Dropped => Ok(()),
            },
        }
    }

    async fn on_member_joined(&self, member: MemberId) -> Result<(), HaError> {
        if member == self.id {
            return Ok(());
        }
        let newly = self.ha.lock().await.view.member_joined(&member);
        if newly {
            self.emit(ClusterCondition::MemberJoined { member });
            // Let the newcomer learn our role and, from a primary, our queues.
            self.announce().await?;
        }
        Ok(())
    }

    async fn on_member_departed(&self, member: MemberId) -> Result<(), HaError> {
        if member == self.id {
            return Ok(());
        }
        let departure = {
            let mut state = self.ha.lock().await;
            let departure = state.view.member_departed(&member);
            if departure.was_primary {
                if let Some(backup) = state.backup.as_mut() {
                    backup.set_primary(None);
                }
            }
            departure
        };

        self.emit(ClusterCondition::MemberDeparted { member: member.clone() });
        for stream in departure.closed_streams {
            self.emit(ClusterCondition::StreamClosed {
                queue: stream.queue,
                peer: stream.peer,
                reason: "peer departed".to_string(),
            });
        }
        if departure.was_primary {
            self.emit(ClusterCondition::PrimaryLost { member });
        }
        Ok(())
    }

    async fn on_control(&self, from: MemberId, frame: SessionFrame) -> Result<(), HaError> {
        match frame.body {
            FrameBody::SessionPing => {
                let pong = SessionFrame::new(frame.session_id, FrameBody::SessionPong, false);
                self.send(pong).await
            }
            FrameBody::SessionPong => {
                debug!("Unclaimed pong from {}", from);
                Ok(())
            }
            FrameBody::MemberAnnounce(announcement) => self.on_announce(from, announcement).await,
            FrameBody::QueueDeclared { queue } if from != self.id => self.on_queue_declared(from, queue).await,
            FrameBody::QueueDeleted { queue } if from != self.id => self.on_queue_deleted(queue).await,
            FrameBody::ReplicaSubscribe {
                queue,
                peer,
                primary,
                low_water_mark,
            } if primary == self.id => self.serve_replica(queue, peer, low_water_mark.into()).await,
            FrameBody::ReplicaCancel { queue, peer } => {
                let mut state = self.ha.lock().await;
                if let Some(id) = state.view.active_stream(&peer, &queue) {
                    state.view.close_stream(id, "cancelled by peer");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_announce(&self, from: MemberId, announcement: Announcement) -> Result<(), HaError> {
        let mut frames = {
            let mut state = self.ha.lock().await;
            state.view.member_announced(&from, &announcement);
            if from == self.id || announcement.role != Role::Primary {
                return Ok(());
            }
            if state.role.role().is_primary() {
                warn!("{} announced itself primary while {} is primary", from, self.id);
                return Ok(());
            }
            match state.backup.as_mut() {
                Some(backup) => backup.set_primary(Some(from.clone())),
                None => return Ok(()),
            }
        };

        for queue in &announcement.queues {
            frames.extend(self.mirror_queue(queue).await?);
        }
        self.request_streams(frames).await
    }

    async fn on_queue_declared(&self, from: MemberId, queue: String) -> Result<(), HaError> {
        let mut frames = {
            let mut state = self.ha.lock().await;
            match state.backup.as_mut() {
                Some(backup) if backup.primary().is_none() => backup.set_primary(Some(from)),
                Some(_) => Vec::new(),
                None => return Ok(()),
            }
        };
        frames.extend(self.mirror_queue(&queue).await?);
        self.request_streams(frames).await
    }

    async fn on_queue_deleted(&self, queue: String) -> Result<(), HaError> {
        {
            let mut state = self.ha.lock().await;
            let Some(backup) = state.backup.as_mut() else {
                return Ok(());
            };
            backup.remove_mirror(&queue);
            let all_ready = backup.all_ready();
            if all_ready && state.leave_catchup() {
                self.ha.publish(&state);
            }
        }
        self.registry.delete(&queue).await?;
        Ok(())
    }

    /// Declare the local copy of a primary queue and build the request for its stream.
    async fn mirror_queue(&self, queue: &str) -> Result<Option<SessionFrame>, HaError> {
        let (shared, _) = self.registry.declare(queue).await?;
        let tail = shared.lock().await.tail();
        let mut state = self.ha.lock().await;
        Ok(state.backup.as_mut().and_then(|backup| backup.mirror(queue, tail)))
    }

    async fn request_streams(&self, frames: Vec<SessionFrame>) -> Result<(), HaError> {
        if frames.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.ha.lock().await;
            if state.enter_catchup() {
                self.ha.publish(&state);
            }
        }
        for frame in frames {
            self.send(frame).await?;
        }
        Ok(())
    }

    /// Primary side of a backup's stream request.
    async fn serve_replica(&self, queue: String, peer: MemberId, start: StartPoint) -> Result<(), HaError> {
        let Some(shared) = self.registry.get(&queue).await else {
            warn!("{} asked to replicate unknown queue {}", peer, queue);
            return Ok(());
        };
        // Held until the backlog is out so live traffic follows catch-up.
        let guard = shared.lock().await;

        let attached = {
            let mut state = self.ha.lock().await;
            let request = ConsumerRequest {
                queue: &guard,
                peer: Some(&peer),
                start,
            };
            match self.ha.consumers().create(ConsumerKind::Replicating, &mut state.view, request) {
                Ok(QueueConsumer::Replicating(attached)) => attached,
                Ok(QueueConsumer::Normal(_)) => return Ok(()),
                Err(AttachError::AlreadyAttached { .. }) => {
                    debug!("{} already has a stream on {}", peer, queue);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Replication request from {} for {} refused: {}", peer, queue, e);
                    return Ok(());
                }
            }
        };

        ReplicatingSubscription::submit(&self.ha, self.transport.as_ref(), &self.id, attached.backlog).await?;
        attached.subscription.caught_up(&mut self.ha.lock().await.view);
        drop(guard);
        Ok(())
    }

    async fn on_replica(&self, frame: SessionFrame) -> Result<(), HaError> {
        if frame.replica_target() != Some(&self.id) {
            return Ok(());
        }
        match frame.body {
            FrameBody::ReplicaEnqueue {
                queue, position, body, ..
            } => self.apply_enqueue(queue, position, body).await,
            FrameBody::ReplicaDequeue { queue, position, .. } => {
                let Some(shared) = self.registry.get(&queue).await else {
                    return Ok(());
                };
                let mut guard = shared.lock().await;
                let mut state = self.ha.lock().await;
                if let Some(backup) = state.backup.as_mut() {
                    backup.apply_dequeue(&mut guard, position)?;
                }
                Ok(())
            }
            FrameBody::ReplicaReady {
                queue, position, head, ..
            } => {
                let Some(shared) = self.registry.get(&queue).await else {
                    return Ok(());
                };
                let mut guard = shared.lock().await;
                let mut state = self.ha.lock().await;
                let Some(backup) = state.backup.as_mut() else {
                    return Ok(());
                };
                if backup.mark_ready(&mut guard, position, head)? && state.leave_catchup() {
                    self.ha.publish(&state);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn apply_enqueue(&self, queue: String, position: Position, body: String) -> Result<(), HaError> {
        // Mirrors are declared before their stream is requested; anything
        // else is left over from a deleted queue.
        let Some(shared) = self.registry.get(&queue).await else {
            debug!("Enqueue {} for unknown queue {} ignored", position, queue);
            return Ok(());
        };
        let mut guard = shared.lock().await;

        let resubscribe = {
            let mut state = self.ha.lock().await;
            let Some(backup) = state.backup.as_mut() else {
                return Ok(());
            };
            match backup.apply_enqueue(&mut guard, position, body) {
                Ok(_) => return Ok(()),
                Err(ApplyError::Storage(e)) => return Err(e.into()),
                Err(ApplyError::Regression(violation)) => {
                    self.emit(ClusterCondition::StreamClosed {
                        queue: queue.clone(),
                        peer: self.id.clone(),
                        reason: violation.to_string(),
                    });
                    backup.resubscribe(&queue)
                }
            }
        };
        drop(guard);
        self.request_streams(resubscribe).await
    }

    fn emit(&self, condition: ClusterCondition) {
        match &condition {
            ClusterCondition::PrimaryLost { member } => {
                warn!("Primary {} lost; promote a backup to restore service", member)
            }
            ClusterCondition::StreamClosed { queue, peer, reason } => {
                warn!("Replication of {} to {} closed: {}", queue, peer, reason)
            }
            ClusterCondition::MemberJoined { member } => info!("Member {} joined", member),
            ClusterCondition::MemberDeparted { member } => info!("Member {} departed", member),
        }
        let _ = self.conditions.send(condition);
    }

    async fn send(&self, frame: SessionFrame) -> Result<(), HaError> {
        self.transport.broadcast(&self.id, frame).await?;
        Ok(())
    }

    /// Tell the cluster our role, addresses and, as primary, our queues.
    pub async fn announce(&self) -> Result<(), HaError> {
        let queues = if self.role().await.is_primary() {
            self.registry.names().await
        } else {
            Vec::new()
        };
        let announcement = HaBroker::announcement(&*self.ha.lock().await, queues);
        self.send(SessionFrame::control(FrameBody::MemberAnnounce(announcement))).await
    }

    pub async fn admit(&self, kind: ConnectionKind) -> Result<(), AdmissionError> {
        self.ha.admit(kind).await
    }

    pub async fn promote(&self) -> Result<Promotion, HaError> {
        let promotion = self.ha.promote().await;
        if let Promotion::Promoted { .. } = promotion {
            self.announce().await?;
        }
        Ok(promotion)
    }

    /// Run a management method and tell the cluster about the result.
    pub async fn manage(&self, method: &str, argument: &str) -> ManagementStatus {
        let status = self.ha.handle_method(method, argument).await;
        if status.is_ok() {
            if let Err(e) = self.announce().await {
                warn!("Announcing after {} failed: {}", method, e);
            }
        }
        status
    }

    async fn require_primary(&self) -> Result<(), HaError> {
        match self.role().await {
            Role::Primary => Ok(()),
            role => Err(HaError::NotPrimary(role)),
        }
    }

    /// Declare a queue. Returns `true` if it was created.
    pub async fn declare_queue(&self, name: &str) -> Result<bool, HaError> {
        self.require_primary().await?;
        let (shared, created) = self.registry.declare(name).await?;
        if !created {
            return Ok(false);
        }

        let guard = shared.lock().await;
        self.send(SessionFrame::control(FrameBody::QueueDeclared {
            queue: name.to_string(),
        }))
        .await?;

        // Every known backup gets a stream from the empty tail.
        let mut frames = Vec::new();
        {
            let mut state = self.ha.lock().await;
            for peer in state.view.backups() {
                let request = ConsumerRequest {
                    queue: &guard,
                    peer: Some(&peer),
                    start: StartPoint::Tail,
                };
                match self.ha.consumers().create(ConsumerKind::Replicating, &mut state.view, request) {
                    Ok(QueueConsumer::Replicating(attached)) => frames.extend(attached.backlog),
                    Ok(QueueConsumer::Normal(_)) => {}
                    Err(e) => debug!("No stream for {} on new queue {}: {}", peer, name, e),
                }
            }
        }
        ReplicatingSubscription::submit(&self.ha, self.transport.as_ref(), &self.id, frames).await?;
        Ok(true)
    }

    /// Delete a queue. Returns `false` if it did not exist.
    pub async fn delete_queue(&self, name: &str) -> Result<bool, HaError> {
        self.require_primary().await?;
        self.ha.lock().await.view.close_streams_for_queue(name, "queue deleted");
        if !self.registry.delete(name).await? {
            return Ok(false);
        }
        self.send(SessionFrame::control(FrameBody::QueueDeleted {
            queue: name.to_string(),
        }))
        .await?;
        Ok(true)
    }

    /// Enqueue a message. It is only acknowledged once the local copy exists
    /// and its replication frames have entered the transport.
    pub async fn enqueue(&self, name: &str, body: String) -> Result<QueuedMessage, HaError> {
        self.require_primary().await?;
        let shared = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| HaError::UnknownQueue(name.to_string()))?;

        // The queue lock orders positions and their replication frames.
        let mut guard = shared.lock().await;
        let message = guard.enqueue(body)?;
        let frames = ReplicatingSubscription::enqueue_frames(&mut self.ha.lock().await.view, name, &message);

        let mut sent = Vec::new();
        let submitted =
            ReplicatingSubscription::submit_tracked(&self.ha, self.transport.as_ref(), &self.id, frames, &mut sent)
                .await;
        if let Err(e) = submitted {
            // Backups that already got the message are told to drop it again.
            let retract =
                ReplicatingSubscription::retract_frames(&self.ha.lock().await.view, name, message.position, &sent);
            if let Err(retract_error) =
                ReplicatingSubscription::submit(&self.ha, self.transport.as_ref(), &self.id, retract).await
            {
                warn!("Withdrawing {} on {} failed: {}", message.position, name, retract_error);
            }
            if let Some(undone) = guard.remove(message.position) {
                guard.dequeue_complete(&undone.message_ref(name))?;
            }
            warn!("Enqueue on {} rolled back: {}", name, e);
            return Err(e);
        }
        Ok(message)
    }

    /// Take the next message, replicating the dequeue before it is removed.
    pub async fn dequeue(&self, name: &str) -> Result<Option<QueuedMessage>, HaError> {
        self.require_primary().await?;
        let shared = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| HaError::UnknownQueue(name.to_string()))?;
        let mut guard = shared.lock().await;

        let (consumer, next, frames) = {
            let mut state = self.ha.lock().await;
            let request = ConsumerRequest {
                queue: &guard,
                peer: None,
                start: StartPoint::Tail,
            };
            let QueueConsumer::Normal(consumer) =
                self.ha.consumers().create(ConsumerKind::Normal, &mut state.view, request)?
            else {
                return Ok(None);
            };
            let Some(next) = consumer.next(&guard) else {
                return Ok(None);
            };
            let frames = ReplicatingSubscription::dequeue_frames(&state.view, name, next.position);
            (consumer, next, frames)
        };

        ReplicatingSubscription::submit(&self.ha, self.transport.as_ref(), &self.id, frames).await?;
        Ok(consumer.acknowledge(&mut guard, next.position)?)
    }

    /// Ask every other member to answer; returns those that did within `timeout`.
    pub async fn ping(&self, timeout: Duration) -> Result<Vec<MemberId>, HaError> {
        let session = Uuid::new_v4();
        let mut replies = self.router.register(session).await;
        let expected = self.transport.members().await.len().saturating_sub(1);

        let result = self
            .send(SessionFrame::new(session, FrameBody::SessionPing, true))
            .await;
        let mut responders = Vec::new();
        if result.is_ok() {
            let _ = tokio::time::timeout(timeout, async {
                while responders.len() < expected {
                    match replies.recv().await {
                        Some(delivery) if delivery.frame.body == FrameBody::SessionPong => {
                            if !responders.contains(&delivery.from) {
                                responders.push(delivery.from);
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            })
            .await;
        }
        self.router.unregister(&session).await;
        result?;

        responders.sort();
        Ok(responders)
    }

    pub async fn messages(&self, name: &str) -> Option<Vec<QueuedMessage>> {
        let shared = self.registry.get(name).await?;
        let guard = shared.lock().await;
        Some(guard.messages_after(Position::ZERO))
    }

    pub async fn status(&self) -> NodeStatus {
        let mut queues = Vec::new();
        for name in self.registry.names().await {
            if let Some(shared) = self.registry.get(&name).await {
                let guard = shared.lock().await;
                queues.push(QueueStatus {
                    name,
                    depth: guard.len(),
                    tail: guard.tail(),
                });
            }
        }

        let state = self.ha.lock().await;
        NodeStatus {
            member_id: self.id.clone(),
            role: state.role.role(),
            attributes: self.ha.attributes(),
            members: state.view.member_statuses(),
            streams: state.view.streams().into_iter().cloned().collect(),
            mirrors: state
                .backup
                .as_ref()
                .map(|b| b.mirrors().cloned().collect())
                .unwrap_or_default(),
            queues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalBus;

    macro_rules! wait_until {
        ($cond:expr) => {{
            let mut reached = false;
            for _ in 0..300 {
                if $cond {
                    reached = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(reached, "condition not reached: {}", stringify!($cond));
        }};
    }

    fn node(bus: &Arc<LocalBus>, id: &str) -> Arc<ClusterNode> {
        let settings = HaSettings::new(id, &format!("amqp:tcp:{}:5672", id));
        ClusterNode::new(
            &settings,
            QueueRegistry::new(),
            bus.clone(),
            Some(Arc::new(ManagementAgent::new(id))),
        )
        .unwrap()
    }

    async fn cluster(ids: &[&str]) -> (Arc<LocalBus>, Vec<Arc<ClusterNode>>) {
        let bus = Arc::new(LocalBus::new());
        let mut nodes = Vec::new();
        for id in ids {
            let node = node(&bus, id);
            node.start().await.unwrap();
            nodes.push(node);
        }
        (bus, nodes)
    }

    async fn depth(node: &ClusterNode, queue: &str) -> usize {
        node.messages(queue).await.map(|m| m.len()).unwrap_or(0)
    }

    async fn knows_primary(node: &ClusterNode, primary: &MemberId) -> bool {
        node.ha().lock().await.backup.as_ref().and_then(|b| b.primary().cloned()) == Some(primary.clone())
    }

    #[tokio::test]
    async fn test_all_members_start_as_backup_and_exclude_clients() {
        let (_bus, nodes) = cluster(&["n1", "n2"]).await;
        for node in &nodes {
            assert_eq!(node.role().await, Role::Backup);
            assert!(matches!(
                node.admit(ConnectionKind::Client).await,
                Err(AdmissionError::ConnectionExcluded { role: Role::Backup })
            ));
            assert!(node.admit(ConnectionKind::Admin).await.is_ok());
        }
        assert!(matches!(nodes[0].enqueue("q", "m".to_string()).await, Err(HaError::NotPrimary(_))));
    }

    #[tokio::test]
    async fn test_promoted_primary_replicates_to_backups() {
        let (_bus, nodes) = cluster(&["n1", "n2", "n3"]).await;
        let (primary, b2, b3) = (&nodes[0], &nodes[1], &nodes[2]);

        assert!(matches!(primary.promote().await.unwrap(), Promotion::Promoted { .. }));
        assert!(primary.admit(ConnectionKind::Client).await.is_ok());
        wait_until!(knows_primary(b2, primary.id()).await && knows_primary(b3, primary.id()).await);

        assert!(primary.declare_queue("orders").await.unwrap());
        for body in ["a", "b", "c"] {
            primary.enqueue("orders", body.to_string()).await.unwrap();
        }

        for backup in [b2, b3] {
            wait_until!(depth(backup, "orders").await == 3);
            let positions: Vec<u64> = backup
                .messages("orders")
                .await
                .unwrap()
                .iter()
                .map(|m| m.position.get())
                .collect();
            assert_eq!(positions, vec![1, 2, 3]);
            // mirroring an enqueue never completes a dequeue in the store
            let shared = backup.registry().get("orders").await.unwrap();
            assert_eq!(shared.lock().await.dequeue_complete_count(), 0);
            wait_until!(backup.role().await == Role::Backup);
        }

        let taken = primary.dequeue("orders").await.unwrap().unwrap();
        assert_eq!(taken.body, "a");
        for backup in [b2, b3] {
            wait_until!(depth(backup, "orders").await == 2);
            let shared = backup.registry().get("orders").await.unwrap();
            assert_eq!(shared.lock().await.dequeue_complete_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_late_joiner_catches_up() {
        let (bus, nodes) = cluster(&["n1"]).await;
        let primary = &nodes[0];
        primary.promote().await.unwrap();
        primary.declare_queue("jobs").await.unwrap();
        for i in 0..5 {
            primary.enqueue("jobs", format!("job-{}", i)).await.unwrap();
        }
        primary.dequeue("jobs").await.unwrap();

        let late = node(&bus, "n2");
        late.start().await.unwrap();

        wait_until!(depth(&late, "jobs").await == 4);
        wait_until!(late.role().await == Role::Backup);
        let first = late.messages("jobs").await.unwrap()[0].clone();
        assert_eq!(first.position, Position(2));
        assert_eq!(first.body, "job-1");

        // live traffic continues after catch-up
        primary.enqueue("jobs", "job-5".to_string()).await.unwrap();
        wait_until!(depth(&late, "jobs").await == 5);

        let status = primary.status().await;
        assert_eq!(status.streams.len(), 1);
        assert_eq!(status.streams[0].state, crate::types::StreamState::Steady);
    }

    #[tokio::test]
    async fn test_failover_to_backup() {
        let (_bus, nodes) = cluster(&["n1", "n2", "n3"]).await;
        let (old, next, other) = (&nodes[0], &nodes[1], &nodes[2]);
        let mut conditions = next.conditions();

        old.promote().await.unwrap();
        wait_until!(knows_primary(next, old.id()).await && knows_primary(other, old.id()).await);
        old.declare_queue("q").await.unwrap();
        old.enqueue("q", "one".to_string()).await.unwrap();
        old.enqueue("q", "two".to_string()).await.unwrap();
        wait_until!(depth(next, "q").await == 2 && depth(other, "q").await == 2);

        old.stop().await;
        let mut lost = false;
        while let Ok(Ok(condition)) = tokio::time::timeout(Duration::from_secs(2), conditions.recv()).await {
            if condition == (ClusterCondition::PrimaryLost { member: old.id().clone() }) {
                lost = true;
                break;
            }
        }
        assert!(lost);
        // nobody takes over on their own
        assert_eq!(next.role().await, Role::Backup);

        assert_eq!(next.manage("promote", "").await, ManagementStatus::Ok);
        assert_eq!(next.role().await, Role::Primary);
        wait_until!(knows_primary(other, next.id()).await);

        let message = next.enqueue("q", "three".to_string()).await.unwrap();
        assert_eq!(message.position, Position(3));
        wait_until!(depth(other, "q").await == 3);
    }

    #[tokio::test]
    async fn test_failed_submission_rolls_back_enqueue() {
        let (bus, nodes) = cluster(&["n1", "n2"]).await;
        let (primary, backup) = (&nodes[0], &nodes[1]);
        primary.promote().await.unwrap();
        wait_until!(knows_primary(backup, primary.id()).await);
        primary.declare_queue("q").await.unwrap();
        wait_until!(primary.status().await.streams.len() == 1);

        // The primary drops out of the group while its stream is still open.
        bus.leave(primary.id()).await;
        let result = primary.enqueue("q", "lost".to_string()).await;
        assert!(matches!(result, Err(HaError::Transport(_))));
        assert_eq!(depth(primary, "q").await, 0);
    }

    /// Lets `pass` replicated enqueues through, fails the next one, then recovers.
    struct FailingEnqueue {
        bus: Arc<LocalBus>,
        pass: std::sync::Mutex<Option<usize>>,
    }

    #[async_trait::async_trait]
    impl FrameTransport for FailingEnqueue {
        async fn join(
            &self,
            member: &MemberId,
        ) -> Result<tokio::sync::mpsc::UnboundedReceiver<TransportEvent>, crate::error::TransportError> {
            self.bus.join(member).await
        }

        async fn leave(&self, member: &MemberId) {
            self.bus.leave(member).await
        }

        async fn broadcast(
            &self,
            from: &MemberId,
            frame: SessionFrame,
        ) -> Result<crate::transport::DeliveryToken, crate::error::TransportError> {
            if matches!(frame.body, FrameBody::ReplicaEnqueue { .. }) {
                let mut pass = self.pass.lock().unwrap();
                let remaining = *pass;
                match remaining {
                    Some(0) => {
                        *pass = None;
                        return Err(crate::error::TransportError::NotJoined(from.clone()));
                    }
                    Some(n) => *pass = Some(n - 1),
                    None => {}
                }
            }
            self.bus.broadcast(from, frame).await
        }

        async fn members(&self) -> Vec<MemberId> {
            self.bus.members().await
        }
    }

    async fn completed(node: &ClusterNode, queue: &str) -> u64 {
        match node.registry().get(queue).await {
            Some(shared) => shared.lock().await.dequeue_complete_count(),
            None => 0,
        }
    }

    #[tokio::test]
    async fn test_partial_replication_failure_withdraws_message() {
        let bus = Arc::new(LocalBus::new());
        let transport = Arc::new(FailingEnqueue {
            bus: bus.clone(),
            pass: std::sync::Mutex::new(None),
        });
        let primary = ClusterNode::new(
            &HaSettings::new("p", "amqp:tcp:p:5672"),
            QueueRegistry::new(),
            transport.clone(),
            Some(Arc::new(ManagementAgent::new("p"))),
        )
        .unwrap();
        primary.start().await.unwrap();
        let (b1, b2) = (node(&bus, "b1"), node(&bus, "b2"));
        b1.start().await.unwrap();
        b2.start().await.unwrap();

        primary.promote().await.unwrap();
        wait_until!(knows_primary(&b1, primary.id()).await && knows_primary(&b2, primary.id()).await);
        primary.declare_queue("q").await.unwrap();
        wait_until!(primary.status().await.streams.len() == 2);

        // the first backup's frame goes out, the second one's fails
        *transport.pass.lock().unwrap() = Some(1);
        assert!(primary.enqueue("q", "half".to_string()).await.is_err());
        assert_eq!(depth(&primary, "q").await, 0);

        wait_until!(completed(&b1, "q").await + completed(&b2, "q").await == 1);
        assert_eq!(depth(&b1, "q").await, 0);
        assert_eq!(depth(&b2, "q").await, 0);
    }

    #[tokio::test]
    async fn test_backup_rejoin_catches_up() {
        let (_bus, nodes) = cluster(&["p", "b"]).await;
        let (primary, backup) = (&nodes[0], &nodes[1]);
        primary.promote().await.unwrap();
        wait_until!(knows_primary(backup, primary.id()).await);
        primary.declare_queue("q").await.unwrap();
        primary.enqueue("q", "m1".to_string()).await.unwrap();
        wait_until!(depth(backup, "q").await == 1);

        backup.stop().await;
        wait_until!(primary.status().await.streams.is_empty());
        primary.enqueue("q", "m2".to_string()).await.unwrap();

        backup.start().await.unwrap();
        primary.enqueue("q", "m3".to_string()).await.unwrap();

        wait_until!(depth(backup, "q").await == 3);
        let bodies: Vec<String> = backup.messages("q").await.unwrap().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec!["m1", "m2", "m3"]);
        wait_until!(backup.role().await == Role::Backup);

        let status = primary.status().await;
        assert_eq!(status.streams.len(), 1);
        assert_eq!(status.streams[0].peer, MemberId::new("b"));
    }

    #[tokio::test]
    async fn test_deleted_queues_leave_no_streams_behind() {
        let (_bus, nodes) = cluster(&["p", "b"]).await;
        let (primary, backup) = (&nodes[0], &nodes[1]);
        primary.promote().await.unwrap();
        wait_until!(knows_primary(backup, primary.id()).await);

        for _ in 0..50 {
            primary.declare_queue("tmp").await.unwrap();
            primary.delete_queue("tmp").await.unwrap();
        }
        assert!(primary.registry().names().await.is_empty());
        assert!(primary.status().await.streams.len() <= 1);
    }

    #[tokio::test]
    async fn test_delete_queue_replicates() {
        let (_bus, nodes) = cluster(&["n1", "n2"]).await;
        let (primary, backup) = (&nodes[0], &nodes[1]);
        primary.promote().await.unwrap();
        wait_until!(knows_primary(backup, primary.id()).await);

        primary.declare_queue("tmp").await.unwrap();
        wait_until!(backup.registry().get("tmp").await.is_some());
        assert!(primary.delete_queue("tmp").await.unwrap());
        wait_until!(backup.registry().get("tmp").await.is_none());
        assert!(!primary.delete_queue("tmp").await.unwrap());
    }

    #[tokio::test]
    async fn test_ping_reaches_other_members() {
        let (_bus, nodes) = cluster(&["n1", "n2", "n3"]).await;
        let responders = nodes[0].ping(Duration::from_secs(2)).await.unwrap();
        assert_eq!(responders, vec![MemberId::new("n2"), MemberId::new("n3")]);
        assert_eq!(nodes[0].router().session_count().await, 0);
    }

    #[tokio::test]
    async fn test_address_changes_reach_other_members() {
        let (_bus, nodes) = cluster(&["n1", "n2"]).await;
        let status = nodes[1].manage("setClientAddresses", "amqp:tcp:vip:5672").await;
        assert!(status.is_ok());

        wait_until!(nodes[0]
            .status()
            .await
            .members
            .iter()
            .any(|m| m.id == MemberId::new("n2") && m.client_addresses.as_deref() == Some("amqp:tcp:vip:5672")));
    }

    #[tokio::test]
    async fn test_promote_twice_reports_success() {
        let (_bus, nodes) = cluster(&["n1"]).await;
        assert!(matches!(nodes[0].promote().await.unwrap(), Promotion::Promoted { from: Role::Backup }));
        assert_eq!(nodes[0].promote().await.unwrap(), Promotion::AlreadyPrimary);
        assert_eq!(nodes[0].ha().admission_changes().await, 1);
    }
}
