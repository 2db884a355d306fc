use storage::Position;

use crate::types::{MemberId, Role};

/// A broker address list that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressError {
    pub input: String,
    pub reason: String,
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid address '{}': {}", self.input, self.reason)
    }
}

impl std::error::Error for AddressError {}

/// Errors reported by a frame transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Sender is not (or no longer) a member of the group
    NotJoined(MemberId),
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotJoined(member) => write!(f, "Member {} has not joined the group", member),
            TransportError::Closed => write!(f, "Transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Replication stream could not be attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    /// An active stream already exists for this peer and queue
    AlreadyAttached { queue: String, peer: MemberId },
    NotPrimary { role: Role },
    UnknownQueue(String),
    MissingPeer,
    PeerDeparted(MemberId),
}

impl std::fmt::Display for AttachError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachError::AlreadyAttached { queue, peer } => {
                write!(f, "Replication stream for {} on queue {} already active", peer, queue)
            }
            AttachError::NotPrimary { role } => {
                write!(f, "Replication streams are only served by a primary (role is {})", role)
            }
            AttachError::UnknownQueue(queue) => write!(f, "Unknown queue: {}", queue),
            AttachError::MissingPeer => write!(f, "Replicating consumer needs a peer"),
            AttachError::PeerDeparted(peer) => write!(f, "Peer {} has left the cluster", peer),
        }
    }
}

impl std::error::Error for AttachError {}

/// Requested role change is not permitted from the current role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleError {
    pub from: Role,
    pub to: Role,
}

impl std::fmt::Display for RoleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid role transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for RoleError {}

/// Connection refused by the admission policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    ConnectionExcluded { role: Role },
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::ConnectionExcluded { role } => write!(
                f,
                "Connection excluded: this broker is a {}, try another member of the cluster",
                role
            ),
        }
    }
}

impl std::error::Error for AdmissionError {}

/// Replication frame out of sequence for its stream or mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyViolation {
    pub queue: String,
    pub peer: MemberId,
    pub expected_after: Position,
    pub got: Position,
}

impl std::fmt::Display for ConsistencyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Replication regression on queue {} for {}: got {} after {}",
            self.queue, self.peer, self.got, self.expected_after
        )
    }
}

impl std::error::Error for ConsistencyViolation {}

/// Top level error for HA operations
#[derive(Debug)]
pub enum HaError {
    /// HA needs the management agent and it is turned off
    ManagementDisabled,
    InvalidAddress(AddressError),
    NotPrimary(Role),
    UnknownQueue(String),
    Storage(std::io::Error),
    Transport(TransportError),
    Attach(AttachError),
    Excluded(AdmissionError),
    Role(RoleError),
    Consistency(ConsistencyViolation),
}

impl std::fmt::Display for HaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaError::ManagementDisabled => {
                write!(f, "Cannot start HA: management is disabled")
            }
            HaError::InvalidAddress(e) => write!(f, "{}", e),
            HaError::NotPrimary(role) => write!(f, "Not primary (role is {})", role),
            HaError::UnknownQueue(queue) => write!(f, "Unknown queue: {}", queue),
            HaError::Storage(e) => write!(f, "Storage error: {}", e),
            HaError::Transport(e) => write!(f, "Transport error: {}", e),
            HaError::Attach(e) => write!(f, "Attach error: {}", e),
            HaError::Excluded(e) => write!(f, "{}", e),
            HaError::Role(e) => write!(f, "{}", e),
            HaError::Consistency(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for HaError {}

impl From<std::io::Error> for HaError {
    fn from(err: std::io::Error) -> Self {
        HaError::Storage(err)
    }
}

impl From<AddressError> for HaError {
    fn from(err: AddressError) -> Self {
        HaError::InvalidAddress(err)
    }
}

impl From<TransportError> for HaError {
    fn from(err: TransportError) -> Self {
        HaError::Transport(err)
    }
}

impl From<AttachError> for HaError {
    fn from(err: AttachError) -> Self {
        HaError::Attach(err)
    }
}

impl From<AdmissionError> for HaError {
    fn from(err: AdmissionError) -> Self {
        HaError::Excluded(err)
    }
}

impl From<RoleError> for HaError {
    fn from(err: RoleError) -> Self {
        HaError::Role(err)
    }
}

impl From<ConsistencyViolation> for HaError {
    fn from(err: ConsistencyViolation) -> Self {
        HaError::Consistency(err)
    }
}
