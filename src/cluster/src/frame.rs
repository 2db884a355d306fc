//! Frames carried by the cluster transport.
//!
//! Every frame belongs to a session. Control frames that are not tied to a
//! broker session use the nil session id and are handled by the cluster
//! controller. Replication frames are always tagged incoming: they are data
//! to apply, never traffic to relay to a client.

use storage::Position;
use uuid::Uuid;

use crate::types::{MemberId, Role};
use crate::url::Url;

/// A member describing itself to the rest of the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub role: Role,
    pub client_addresses: Url,
    pub broker_addresses: Url,
    /// Queues held by the sender; only meaningful from a primary
    pub queues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    SessionPing,
    SessionPong,
    MemberAnnounce(Announcement),
    QueueDeclared {
        queue: String,
    },
    QueueDeleted {
        queue: String,
    },
    /// Backup asks the primary for a replication stream
    ReplicaSubscribe {
        queue: String,
        peer: MemberId,
        primary: MemberId,
        /// Highest position the backup already holds; `None` starts at the tail
        low_water_mark: Option<Position>,
    },
    /// Backup drops its stream, usually just before resubscribing
    ReplicaCancel {
        queue: String,
        peer: MemberId,
    },
    ReplicaEnqueue {
        queue: String,
        peer: MemberId,
        position: Position,
        body: String,
    },
    ReplicaDequeue {
        queue: String,
        peer: MemberId,
        position: Position,
    },
    /// Catch-up is over; `head` is the oldest position the primary still holds
    ReplicaReady {
        queue: String,
        peer: MemberId,
        position: Position,
        head: Option<Position>,
    },
}

impl FrameBody {
    pub fn name(&self) -> &'static str {
        match self {
            FrameBody::SessionPing => "session-ping",
            FrameBody::SessionPong => "session-pong",
            FrameBody::MemberAnnounce(_) => "member-announce",
            FrameBody::QueueDeclared { .. } => "queue-declared",
            FrameBody::QueueDeleted { .. } => "queue-deleted",
            FrameBody::ReplicaSubscribe { .. } => "replica-subscribe",
            FrameBody::ReplicaCancel { .. } => "replica-cancel",
            FrameBody::ReplicaEnqueue { .. } => "replica-enqueue",
            FrameBody::ReplicaDequeue { .. } => "replica-dequeue",
            FrameBody::ReplicaReady { .. } => "replica-ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFrame {
    pub session_id: Uuid,
    pub body: FrameBody,
    /// `true` for traffic flowing into the broker
    pub is_incoming: bool,
}

impl SessionFrame {
    pub fn new(session_id: Uuid, body: FrameBody, is_incoming: bool) -> Self {
        SessionFrame {
            session_id,
            body,
            is_incoming,
        }
    }

    /// Frame with no session, handled by the cluster controller
    pub fn control(body: FrameBody) -> Self {
        Self::new(Uuid::nil(), body, true)
    }

    /// Replication data addressed to a mirror
    pub fn replication(body: FrameBody) -> Self {
        Self::new(Uuid::nil(), body, true)
    }

    /// Liveness and cluster-control frames, whatever their session
    pub fn is_control(&self) -> bool {
        matches!(
            self.body,
            FrameBody::SessionPing
                | FrameBody::SessionPong
                | FrameBody::MemberAnnounce(_)
                | FrameBody::QueueDeclared { .. }
                | FrameBody::QueueDeleted { .. }
                | FrameBody::ReplicaSubscribe { .. }
                | FrameBody::ReplicaCancel { .. }
        )
    }

    pub fn is_replication(&self) -> bool {
        self.replica_target().is_some()
    }

    /// The backup a replication data frame is meant for
    pub fn replica_target(&self) -> Option<&MemberId> {
        match &self.body {
            FrameBody::ReplicaEnqueue { peer, .. }
            | FrameBody::ReplicaDequeue { peer, .. }
            | FrameBody::ReplicaReady { peer, .. } => Some(peer),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_classification() {
        let ping = SessionFrame::control(FrameBody::SessionPing);
        assert!(ping.is_control());
        assert!(!ping.is_replication());

        let data = SessionFrame::replication(FrameBody::ReplicaDequeue {
            queue: "q".to_string(),
            peer: MemberId::new("b"),
            position: Position(3),
        });
        assert!(data.is_replication());
        assert!(!data.is_control());
        assert!(data.is_incoming);
        assert_eq!(data.replica_target(), Some(&MemberId::new("b")));

        let subscribe = SessionFrame::control(FrameBody::ReplicaSubscribe {
            queue: "q".to_string(),
            peer: MemberId::new("b"),
            primary: MemberId::new("a"),
            low_water_mark: None,
        });
        assert!(!subscribe.is_replication());
        assert!(subscribe.is_control());

        // a ping keeps its session and stays a control frame
        let sessioned = SessionFrame::new(Uuid::new_v4(), FrameBody::SessionPing, true);
        assert!(sessioned.is_control());
        let cancel = SessionFrame::new(
            Uuid::new_v4(),
            FrameBody::ReplicaCancel {
                queue: "q".to_string(),
                peer: MemberId::new("b"),
            },
            true,
        );
        assert!(cancel.is_control());
    }
}
