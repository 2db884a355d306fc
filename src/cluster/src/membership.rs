//! Local view of cluster membership and of the replication streams this
//! broker serves.
//!
//! Members and streams live in one arena owned by the view. Streams refer to
//! their peer by id, so a member departing never leaves a dangling handle;
//! instead every stream to that peer is closed and its record dropped.

use std::collections::{BTreeMap, HashMap};

use log::{info, warn};
use serde::Serialize;
use storage::Position;

use crate::error::{AdmissionError, AttachError, ConsistencyViolation};
use crate::frame::Announcement;
use crate::types::{ConnectionKind, Liveness, Member, MemberId, Role, StreamId, StreamState};

/// Primary-side state of one replication stream
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationStream {
    pub id: StreamId,
    pub queue: String,
    pub peer: MemberId,
    /// Last position sent to the peer
    pub cursor: Position,
    pub state: StreamState,
}

impl ReplicationStream {
    pub fn is_open(&self) -> bool {
        self.state != StreamState::Closed
    }
}

/// What a departure took down with it
#[derive(Debug, Default)]
pub struct Departure {
    pub closed_streams: Vec<ReplicationStream>,
    pub was_primary: bool,
}

/// Serializable summary of a member
#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub id: MemberId,
    pub role: Option<Role>,
    pub liveness: Liveness,
    pub client_addresses: Option<String>,
    pub broker_addresses: Option<String>,
}

pub struct ClusterView {
    self_id: MemberId,
    members: BTreeMap<MemberId, Member>,
    streams: HashMap<StreamId, ReplicationStream>,
    /// Active stream per (peer, queue)
    active: HashMap<(MemberId, String), StreamId>,
    next_stream: u64,
    clients_admitted: bool,
    admission_changes: u32,
}

impl ClusterView {
    pub fn new(self_id: MemberId) -> Self {
        let mut members = BTreeMap::new();
        let mut local = Member::new(self_id.clone());
        local.role = Some(Role::Backup);
        members.insert(self_id.clone(), local);

        ClusterView {
            self_id,
            members,
            streams: HashMap::new(),
            active: HashMap::new(),
            next_stream: 1,
            clients_admitted: false,
            admission_changes: 0,
        }
    }

    pub fn self_id(&self) -> &MemberId {
        &self.self_id
    }

    /// Record a join. Returns `true` if the member was not already known alive.
    pub fn member_joined(&mut self, id: &MemberId) -> bool {
        match self.members.get_mut(id) {
            Some(member) if member.is_alive() => false,
            Some(member) => {
                member.liveness = Liveness::Alive;
                member.role = None;
                true
            }
            None => {
                self.members.insert(id.clone(), Member::new(id.clone()));
                true
            }
        }
    }

    pub fn member_announced(&mut self, id: &MemberId, announcement: &Announcement) {
        let member = self
            .members
            .entry(id.clone())
            .or_insert_with(|| Member::new(id.clone()));
        member.liveness = Liveness::Alive;
        member.role = Some(announcement.role);
        member.client_addresses = Some(announcement.client_addresses.clone());
        member.broker_addresses = Some(announcement.broker_addresses.clone());
    }

    /// Mark a member departed and close every stream serving it.
    pub fn member_departed(&mut self, id: &MemberId) -> Departure {
        let Some(member) = self.members.get_mut(id) else {
            return Departure::default();
        };
        if !member.is_alive() {
            return Departure::default();
        }
        member.liveness = Liveness::Departed;
        let was_primary = member.role == Some(Role::Primary);

        let ids: Vec<StreamId> = self
            .streams
            .values()
            .filter(|s| &s.peer == id && s.is_open())
            .map(|s| s.id)
            .collect();
        let closed_streams = ids
            .into_iter()
            .filter_map(|stream| self.close_stream(stream, "peer departed"))
            .collect();
        // A rejoining peer gets fresh streams.
        self.forget_peer(id);

        Departure {
            closed_streams,
            was_primary,
        }
    }

    pub fn member(&self, id: &MemberId) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn is_alive(&self, id: &MemberId) -> bool {
        self.members.get(id).map(Member::is_alive).unwrap_or(false)
    }

    pub fn alive_members(&self) -> Vec<MemberId> {
        self.members
            .values()
            .filter(|m| m.is_alive())
            .map(|m| m.id.clone())
            .collect()
    }

    /// Live members other than this broker that are not primary
    pub fn backups(&self) -> Vec<MemberId> {
        self.members
            .values()
            .filter(|m| m.is_alive() && m.id != self.self_id && m.role != Some(Role::Primary))
            .map(|m| m.id.clone())
            .collect()
    }

    /// The live member currently announcing itself as primary
    pub fn primary(&self) -> Option<&Member> {
        self.members
            .values()
            .find(|m| m.is_alive() && m.role == Some(Role::Primary))
    }

    pub fn set_local_role(&mut self, role: Role) {
        if let Some(local) = self.members.get_mut(&self.self_id) {
            local.role = Some(role);
        }
    }

    pub fn local_role(&self) -> Role {
        self.members
            .get(&self.self_id)
            .and_then(|m| m.role)
            .unwrap_or(Role::Backup)
    }

    /// Admission policy: client connections are excluded until the broker
    /// is opened to clients on promotion.
    pub fn admit(&self, kind: ConnectionKind) -> Result<(), AdmissionError> {
        match kind {
            ConnectionKind::Client if !self.clients_admitted => Err(AdmissionError::ConnectionExcluded {
                role: self.local_role(),
            }),
            _ => Ok(()),
        }
    }

    /// Start admitting clients. Returns `false` if they already were.
    pub fn admit_clients(&mut self) -> bool {
        if self.clients_admitted {
            return false;
        }
        self.clients_admitted = true;
        self.admission_changes += 1;
        info!("Client connections now admitted");
        true
    }

    /// Number of times the admission policy changed
    pub fn admission_changes(&self) -> u32 {
        self.admission_changes
    }

    pub fn open_stream(
        &mut self,
        queue: &str,
        peer: &MemberId,
        cursor: Position,
        state: StreamState,
    ) -> Result<StreamId, AttachError> {
        if !self.is_alive(peer) {
            return Err(AttachError::PeerDeparted(peer.clone()));
        }
        let key = (peer.clone(), queue.to_string());
        if let Some(existing) = self.active.get(&key) {
            if self.streams.get(existing).map(ReplicationStream::is_open).unwrap_or(false) {
                return Err(AttachError::AlreadyAttached {
                    queue: queue.to_string(),
                    peer: peer.clone(),
                });
            }
            let stale = *existing;
            self.streams.remove(&stale);
        }

        let id = StreamId(self.next_stream);
        self.next_stream += 1;
        self.streams.insert(
            id,
            ReplicationStream {
                id,
                queue: queue.to_string(),
                peer: peer.clone(),
                cursor,
                state,
            },
        );
        self.active.insert(key, id);
        info!("Replication {} opened for {} on queue {} at {}", id, peer, queue, cursor);
        Ok(id)
    }

    pub fn stream(&self, id: StreamId) -> Option<&ReplicationStream> {
        self.streams.get(&id)
    }

    pub fn is_stream_open(&self, id: StreamId) -> bool {
        self.streams.get(&id).map(ReplicationStream::is_open).unwrap_or(false)
    }

    pub fn active_stream(&self, peer: &MemberId, queue: &str) -> Option<StreamId> {
        self.active
            .get(&(peer.clone(), queue.to_string()))
            .copied()
            .filter(|id| self.is_stream_open(*id))
    }

    /// Open streams for a queue, ordered by id
    pub fn open_streams_for(&self, queue: &str) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self
            .streams
            .values()
            .filter(|s| s.queue == queue && s.is_open())
            .map(|s| s.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn streams(&self) -> Vec<&ReplicationStream> {
        let mut streams: Vec<&ReplicationStream> = self.streams.values().collect();
        streams.sort_by_key(|s| s.id);
        streams
    }

    pub fn set_stream_state(&mut self, id: StreamId, state: StreamState) {
        if let Some(stream) = self.streams.get_mut(&id) {
            if stream.is_open() {
                stream.state = state;
            }
        }
    }

    /// Move the cursor forward. A regression closes the stream.
    pub fn advance_cursor(&mut self, id: StreamId, position: Position) -> Result<(), ConsistencyViolation> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        if position <= stream.cursor {
            let violation = ConsistencyViolation {
                queue: stream.queue.clone(),
                peer: stream.peer.clone(),
                expected_after: stream.cursor,
                got: position,
            };
            warn!("{}", violation);
            self.close_stream(id, "cursor regression");
            return Err(violation);
        }
        stream.cursor = position;
        Ok(())
    }

    /// Close a stream. Returns the stream if this call closed it.
    pub fn close_stream(&mut self, id: StreamId, reason: &str) -> Option<ReplicationStream> {
        let stream = self.streams.get_mut(&id)?;
        if !stream.is_open() {
            return None;
        }
        stream.state = StreamState::Closed;
        info!(
            "Replication {} for {} on queue {} closed: {}",
            id, stream.peer, stream.queue, reason
        );
        Some(stream.clone())
    }

    /// Close and forget every stream for a deleted queue.
    pub fn close_streams_for_queue(&mut self, queue: &str, reason: &str) -> Vec<ReplicationStream> {
        let closed = self
            .open_streams_for(queue)
            .into_iter()
            .filter_map(|id| self.close_stream(id, reason))
            .collect();
        self.streams.retain(|_, s| s.queue != queue);
        self.active.retain(|(_, q), _| q != queue);
        closed
    }

    fn forget_peer(&mut self, peer: &MemberId) {
        self.streams.retain(|_, s| &s.peer != peer);
        self.active.retain(|(p, _), _| p != peer);
    }

    pub fn member_statuses(&self) -> Vec<MemberStatus> {
        self.members
            .values()
            .map(|m| MemberStatus {
                id: m.id.clone(),
                role: m.role,
                liveness: m.liveness,
                client_addresses: m.client_addresses.as_ref().map(|u| u.to_string()),
                broker_addresses: m.broker_addresses.as_ref().map(|u| u.to_string()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::Url;

    fn announce(role: Role) -> Announcement {
        let url: Url = "amqp:tcp:127.0.0.1:5672".parse().unwrap();
        Announcement {
            role,
            client_addresses: url.clone(),
            broker_addresses: url,
            queues: Vec::new(),
        }
    }

    fn view_with_peer() -> (ClusterView, MemberId) {
        let mut view = ClusterView::new(MemberId::new("a"));
        let peer = MemberId::new("b");
        view.member_joined(&peer);
        (view, peer)
    }

    #[test]
    fn test_admission_follows_local_role() {
        let mut view = ClusterView::new(MemberId::new("a"));
        assert_eq!(
            view.admit(ConnectionKind::Client),
            Err(AdmissionError::ConnectionExcluded { role: Role::Backup })
        );
        assert!(view.admit(ConnectionKind::Replication).is_ok());
        assert!(view.admit(ConnectionKind::Admin).is_ok());

        view.set_local_role(Role::Catchup);
        assert_eq!(
            view.admit(ConnectionKind::Client),
            Err(AdmissionError::ConnectionExcluded { role: Role::Catchup })
        );

        view.set_local_role(Role::Primary);
        assert!(view.admit_clients());
        assert!(!view.admit_clients());
        assert!(view.admit(ConnectionKind::Client).is_ok());
        assert_eq!(view.admission_changes(), 1);
    }

    #[test]
    fn test_one_active_stream_per_peer_and_queue() {
        let (mut view, peer) = view_with_peer();
        let id = view.open_stream("q", &peer, Position::ZERO, StreamState::Steady).unwrap();
        assert_eq!(
            view.open_stream("q", &peer, Position::ZERO, StreamState::Steady),
            Err(AttachError::AlreadyAttached { queue: "q".to_string(), peer: peer.clone() })
        );
        assert!(view.open_stream("other", &peer, Position::ZERO, StreamState::Steady).is_ok());

        view.close_stream(id, "test");
        let reopened = view.open_stream("q", &peer, Position(4), StreamState::Catchup).unwrap();
        assert_ne!(reopened, id);
        assert_eq!(view.active_stream(&peer, "q"), Some(reopened));
    }

    #[test]
    fn test_departure_closes_streams() {
        let (mut view, peer) = view_with_peer();
        view.member_announced(&peer, &announce(Role::Primary));
        let s1 = view.open_stream("q1", &peer, Position::ZERO, StreamState::Steady).unwrap();
        let s2 = view.open_stream("q2", &peer, Position::ZERO, StreamState::Steady).unwrap();

        let departure = view.member_departed(&peer);
        assert!(departure.was_primary);
        assert_eq!(departure.closed_streams.len(), 2);
        assert!(!view.is_stream_open(s1));
        assert!(!view.is_stream_open(s2));
        assert!(view.primary().is_none());

        // second notice changes nothing
        assert!(view.member_departed(&peer).closed_streams.is_empty());
        assert_eq!(
            view.open_stream("q1", &peer, Position::ZERO, StreamState::Steady),
            Err(AttachError::PeerDeparted(peer))
        );
    }

    #[test]
    fn test_cursor_regression_closes_stream() {
        let (mut view, peer) = view_with_peer();
        let id = view.open_stream("q", &peer, Position(5), StreamState::Steady).unwrap();
        view.advance_cursor(id, Position(6)).unwrap();

        let err = view.advance_cursor(id, Position(6)).unwrap_err();
        assert_eq!(err.expected_after, Position(6));
        assert_eq!(view.stream(id).map(|s| s.state), Some(StreamState::Closed));
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let (mut view, peer) = view_with_peer();
        let id = view.open_stream("q", &peer, Position::ZERO, StreamState::Catchup).unwrap();
        assert!(view.close_stream(id, "first").is_some());
        assert!(view.close_stream(id, "second").is_none());

        view.set_stream_state(id, StreamState::Steady);
        assert_eq!(view.stream(id).map(|s| s.state), Some(StreamState::Closed));
        assert!(view.active_stream(&peer, "q").is_none());
    }

    #[test]
    fn test_deleted_queues_leave_no_stream_records() {
        let (mut view, peer) = view_with_peer();
        for round in 0..50 {
            let queue = format!("q{}", round % 3);
            view.open_stream(&queue, &peer, Position::ZERO, StreamState::Steady).unwrap();
            assert_eq!(view.close_streams_for_queue(&queue, "queue deleted").len(), 1);
        }
        assert!(view.streams().is_empty());

        view.open_stream("kept", &peer, Position::ZERO, StreamState::Steady).unwrap();
        view.close_streams_for_queue("other", "queue deleted");
        assert_eq!(view.streams().len(), 1);
    }

    #[test]
    fn test_rejoined_peer_gets_a_fresh_stream() {
        let (mut view, peer) = view_with_peer();
        let first = view.open_stream("q", &peer, Position(2), StreamState::Steady).unwrap();

        assert_eq!(view.member_departed(&peer).closed_streams.len(), 1);
        assert!(view.streams().is_empty());
        assert_eq!(
            view.open_stream("q", &peer, Position(2), StreamState::Steady),
            Err(AttachError::PeerDeparted(peer.clone()))
        );

        assert!(view.member_joined(&peer));
        let second = view.open_stream("q", &peer, Position(2), StreamState::Catchup).unwrap();
        assert_ne!(second, first);
        assert_eq!(view.active_stream(&peer, "q"), Some(second));
        assert_eq!(view.streams().len(), 1);
    }

    #[test]
    fn test_backups_excludes_self_and_primary() {
        let mut view = ClusterView::new(MemberId::new("a"));
        view.set_local_role(Role::Primary);
        view.member_joined(&MemberId::new("b"));
        view.member_joined(&MemberId::new("c"));
        view.member_departed(&MemberId::new("c"));
        assert_eq!(view.backups(), vec![MemberId::new("b")]);
        assert_eq!(view.primary().map(|m| m.id.clone()), Some(MemberId::new("a")));
    }
}
