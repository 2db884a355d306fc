use std::fmt;

use serde::{Deserialize, Serialize};
use storage::Position;

use crate::url::Url;

/// Opaque identity of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn new(id: &str) -> Self {
        MemberId(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker role in an HA cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Backup,
    /// Backup that is still building its initial queue mirrors
    Catchup,
    Primary,
}

impl Role {
    pub fn is_primary(&self) -> bool {
        matches!(self, Role::Primary)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Backup => "backup",
            Role::Catchup => "catchup",
            Role::Primary => "primary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Alive,
    Departed,
}

/// A broker process taking part in the cluster
#[derive(Debug, Clone)]
pub struct Member {
    pub id: MemberId,
    pub client_addresses: Option<Url>,
    pub broker_addresses: Option<Url>,
    /// `None` until the member has announced itself
    pub role: Option<Role>,
    pub liveness: Liveness,
}

impl Member {
    pub fn new(id: MemberId) -> Self {
        Member {
            id,
            client_addresses: None,
            broker_addresses: None,
            role: None,
            liveness: Liveness::Alive,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.liveness == Liveness::Alive
    }
}

/// What a connecting peer declares itself to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Ordinary messaging client
    Client,
    /// Intra-cluster replication link
    Replication,
    /// Management-only connection
    Admin,
}

impl ConnectionKind {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "client" | "" => Some(ConnectionKind::Client),
            "replication" => Some(ConnectionKind::Replication),
            "admin" => Some(ConnectionKind::Admin),
            _ => None,
        }
    }
}

/// Consumer type declared when attaching to a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    Normal,
    Replicating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Catchup,
    Steady,
    Closed,
}

/// Where a new replication stream starts reading the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPoint {
    /// Only messages enqueued after attach
    Tail,
    /// Everything still held with a position above the low-water-mark
    After(Position),
}

impl From<Option<Position>> for StartPoint {
    fn from(low_water_mark: Option<Position>) -> Self {
        match low_water_mark {
            Some(position) => StartPoint::After(position),
            None => StartPoint::Tail,
        }
    }
}

/// Conditions surfaced to whoever manages the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCondition {
    MemberJoined { member: MemberId },
    MemberDeparted { member: MemberId },
    /// The PRIMARY left; an external actor must decide who to promote
    PrimaryLost { member: MemberId },
    StreamClosed { queue: String, peer: MemberId, reason: String },
}
