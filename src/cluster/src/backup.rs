//! Backup side of replication: local mirrors of the primary's queues.

use std::collections::BTreeMap;
use std::io;

use log::{debug, info, warn};
use serde::Serialize;
use storage::{DurableQueue, PersistableQueue, Position};

use crate::error::ConsistencyViolation;
use crate::frame::{FrameBody, SessionFrame};
use crate::types::MemberId;
use crate::url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorState {
    /// Waiting for the primary's catch-up to finish
    Subscribing,
    Ready,
    /// Saw an out-of-order frame; needs a fresh stream
    Broken,
}

#[derive(Debug, Clone, Serialize)]
pub struct Mirror {
    pub queue: String,
    pub last_applied: Position,
    pub state: MirrorState,
}

/// Why a replicated enqueue was not applied
#[derive(Debug)]
pub enum ApplyError {
    Regression(ConsistencyViolation),
    Storage(io::Error),
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyError::Regression(e) => write!(f, "{}", e),
            ApplyError::Storage(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl std::error::Error for ApplyError {}

impl From<io::Error> for ApplyError {
    fn from(err: io::Error) -> Self {
        ApplyError::Storage(err)
    }
}

/// Replication machinery that exists only while the broker is a backup.
pub struct Backup {
    self_id: MemberId,
    broker_url: Url,
    primary: Option<MemberId>,
    mirrors: BTreeMap<String, Mirror>,
}

impl Backup {
    pub fn new(self_id: MemberId, broker_url: Url) -> Self {
        info!("Backup started, broker URL {}", broker_url);
        Backup {
            self_id,
            broker_url,
            primary: None,
            mirrors: BTreeMap::new(),
        }
    }

    pub fn broker_url(&self) -> &Url {
        &self.broker_url
    }

    pub fn set_url(&mut self, url: Url) {
        info!("Backup broker URL set to {}", url);
        self.broker_url = url;
    }

    pub fn primary(&self) -> Option<&MemberId> {
        self.primary.as_ref()
    }

    /// Track a change of primary. Every mirror has to be rebuilt from the new
    /// primary; the returned frames request that.
    pub fn set_primary(&mut self, primary: Option<MemberId>) -> Vec<SessionFrame> {
        if self.primary == primary {
            return Vec::new();
        }
        match &primary {
            Some(p) => info!("Primary is now {}", p),
            None => warn!("Primary lost, mirrors waiting for a new primary"),
        }
        self.primary = primary;

        for mirror in self.mirrors.values_mut() {
            mirror.state = MirrorState::Subscribing;
        }
        let queues: Vec<String> = self.mirrors.keys().cloned().collect();
        queues
            .iter()
            .filter_map(|queue| self.subscribe_frame(queue))
            .collect()
    }

    /// This member is (re)joining the group. Streams the primary served us
    /// were closed when we left, so every mirror waits to be resubscribed
    /// once a primary announces itself.
    pub fn rejoined(&mut self) {
        if self.primary.take().is_some() {
            info!("Rejoining, {} mirrors wait for the primary", self.mirrors.len());
        }
        for mirror in self.mirrors.values_mut() {
            mirror.state = MirrorState::Subscribing;
        }
    }

    /// Start mirroring a queue, asking the primary for everything above `last_applied`.
    pub fn mirror(&mut self, queue: &str, last_applied: Position) -> Option<SessionFrame> {
        if let Some(existing) = self.mirrors.get(queue) {
            if existing.state != MirrorState::Broken {
                return None;
            }
        }
        self.mirrors.insert(
            queue.to_string(),
            Mirror {
                queue: queue.to_string(),
                last_applied,
                state: MirrorState::Subscribing,
            },
        );
        self.subscribe_frame(queue)
    }

    /// A stream is coming without being asked for (new queue on the primary).
    pub fn expect_mirror(&mut self, queue: &str, last_applied: Position) {
        self.mirrors.entry(queue.to_string()).or_insert_with(|| Mirror {
            queue: queue.to_string(),
            last_applied,
            state: MirrorState::Subscribing,
        });
    }

    /// Drop the current stream and ask for a new one from `last_applied`.
    pub fn resubscribe(&mut self, queue: &str) -> Vec<SessionFrame> {
        let Some(mirror) = self.mirrors.get_mut(queue) else {
            return Vec::new();
        };
        mirror.state = MirrorState::Subscribing;

        let mut frames = vec![SessionFrame::control(FrameBody::ReplicaCancel {
            queue: queue.to_string(),
            peer: self.self_id.clone(),
        })];
        frames.extend(self.subscribe_frame(queue));
        frames
    }

    fn subscribe_frame(&self, queue: &str) -> Option<SessionFrame> {
        let primary = self.primary.clone()?;
        let mirror = self.mirrors.get(queue)?;
        Some(SessionFrame::control(FrameBody::ReplicaSubscribe {
            queue: queue.to_string(),
            peer: self.self_id.clone(),
            primary,
            low_water_mark: Some(mirror.last_applied),
        }))
    }

    pub fn remove_mirror(&mut self, queue: &str) -> bool {
        self.mirrors.remove(queue).is_some()
    }

    pub fn mirror_state(&self, queue: &str) -> Option<&Mirror> {
        self.mirrors.get(queue)
    }

    pub fn mirrors(&self) -> impl Iterator<Item = &Mirror> {
        self.mirrors.values()
    }

    pub fn all_ready(&self) -> bool {
        self.mirrors.values().all(|m| m.state == MirrorState::Ready)
    }

    /// Apply a replicated enqueue to the local mirror.
    ///
    /// While a mirror is subscribing, catch-up may replay positions it already
    /// holds and those are skipped. Once ready, positions must strictly increase.
    pub fn apply_enqueue(
        &mut self,
        queue: &mut DurableQueue,
        position: Position,
        body: String,
    ) -> Result<bool, ApplyError> {
        let name = queue.name().to_string();
        let tail = queue.tail();
        let mirror = self.mirrors.entry(name.clone()).or_insert_with(|| Mirror {
            queue: name.clone(),
            last_applied: tail,
            state: MirrorState::Subscribing,
        });

        match mirror.state {
            MirrorState::Broken => {
                debug!("Ignoring enqueue {} for broken mirror {}", position, name);
                return Ok(false);
            }
            MirrorState::Subscribing if position <= mirror.last_applied => {
                debug!("Skipping replayed enqueue {} on {}", position, name);
                return Ok(false);
            }
            MirrorState::Ready if position <= mirror.last_applied => {
                mirror.state = MirrorState::Broken;
                let violation = ConsistencyViolation {
                    queue: name,
                    peer: self.self_id.clone(),
                    expected_after: mirror.last_applied,
                    got: position,
                };
                warn!("{}", violation);
                return Err(ApplyError::Regression(violation));
            }
            _ => {}
        }

        queue.enqueue_at(position, body)?;
        mirror.last_applied = position;
        Ok(true)
    }

    /// Apply a replicated dequeue. The store is told exactly once per message
    /// actually removed here.
    pub fn apply_dequeue(&mut self, queue: &mut DurableQueue, position: Position) -> io::Result<bool> {
        match queue.remove(position) {
            Some(message) => {
                let message_ref = message.message_ref(queue.name());
                queue.dequeue_complete(&message_ref)?;
                Ok(true)
            }
            None => {
                debug!("Dequeue {} on {} not held locally", position, queue.name());
                Ok(false)
            }
        }
    }

    /// The primary finished catch-up for this mirror. Messages the primary no
    /// longer holds (below `head`) are dropped. Returns `true` if this made
    /// every mirror ready.
    pub fn mark_ready(
        &mut self,
        queue: &mut DurableQueue,
        position: Position,
        head: Option<Position>,
    ) -> io::Result<bool> {
        let name = queue.name().to_string();
        let Some(mirror) = self.mirrors.get_mut(&name) else {
            return Ok(false);
        };
        if mirror.state != MirrorState::Subscribing {
            return Ok(false);
        }

        let cutoff = head.unwrap_or(position.next());
        let stale: Vec<Position> = queue
            .messages_after(Position::ZERO)
            .iter()
            .map(|m| m.position)
            .filter(|p| *p < cutoff)
            .collect();
        for position in stale {
            if let Some(message) = queue.remove(position) {
                queue.dequeue_complete(&message.message_ref(&name))?;
            }
        }

        mirror.state = MirrorState::Ready;
        if position > mirror.last_applied {
            mirror.last_applied = position;
        }
        info!("Mirror {} ready at {}", name, mirror.last_applied);
        Ok(self.all_ready())
    }
}
