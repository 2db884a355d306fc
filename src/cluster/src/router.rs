use std::collections::HashMap;

use log::{debug, warn};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::frame::{FrameBody, SessionFrame};
use crate::types::MemberId;

/// A frame handed to a local broker session
#[derive(Debug, Clone)]
pub struct SessionDelivery {
    pub from: MemberId,
    pub frame: SessionFrame,
}

/// Where a delivered frame ended up
#[derive(Debug)]
pub enum Routed {
    /// Delivered to the local session with this id
    Session(Uuid),
    /// Un-sessioned control frame for the cluster controller
    Controller(SessionFrame),
    /// Replication data for the local mirrors
    Replica(SessionFrame),
    /// No live session and not a control frame
    Dropped,
}

/// Maps session ids to the local sessions that own them.
pub struct SessionRouter {
    sessions: RwLock<HashMap<Uuid, mpsc::UnboundedSender<SessionDelivery>>>,
}

impl SessionRouter {
    pub fn new() -> Self {
        SessionRouter {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, session_id: Uuid) -> mpsc::UnboundedReceiver<SessionDelivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.write().await.insert(session_id, tx);
        debug!("Session {} registered", session_id);
        rx
    }

    pub async fn unregister(&self, session_id: &Uuid) {
        if self.sessions.write().await.remove(session_id).is_some() {
            debug!("Session {} unregistered", session_id);
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn route(&self, from: &MemberId, mut frame: SessionFrame) -> Routed {
        if frame.is_replication() {
            // Mirrored data is applied locally, never relayed to a client.
            frame.is_incoming = true;
            return Routed::Replica(frame);
        }

        let session = self.sessions.read().await.get(&frame.session_id).cloned();
        if let Some(tx) = session {
            let session_id = frame.session_id;
            let delivery = SessionDelivery {
                from: from.clone(),
                frame,
            };
            if tx.send(delivery).is_ok() {
                return Routed::Session(session_id);
            }
            self.unregister(&session_id).await;
            warn!("Dropping frame for closed session {}", session_id);
            return Routed::Dropped;
        }

        // A sessioned pong answers some other member's ping.
        let foreign_reply = frame.body == FrameBody::SessionPong && !frame.session_id.is_nil();
        if frame.is_control() && !foreign_reply {
            return Routed::Controller(frame);
        }

        debug!(
            "Dropping {} frame for unknown session {} from {}",
            frame.body.name(),
            frame.session_id,
            from
        );
        Routed::Dropped
    }
}

impl Default for SessionRouter {
    fn default() -> Self {
        Self::new()
    }
}
