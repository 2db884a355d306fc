pub mod config;
pub mod error;
pub mod types;
pub mod url;

// Transport and routing
pub mod frame;
pub mod transport;
pub mod router;

// HA core
pub mod role;
pub mod membership;
pub mod management;
pub mod subscription;
pub mod consumer;
pub mod backup;
pub mod ha_broker;
pub mod node;

// Re-exports for convenience
pub use config::HaSettings;
pub use error::{AddressError, AdmissionError, AttachError, ConsistencyViolation, HaError, RoleError, TransportError};
pub use types::*;
pub use url::{Address, Url};
pub use frame::{Announcement, FrameBody, SessionFrame};
pub use transport::{DeliveryToken, FrameTransport, LocalBus, TransportEvent};
pub use router::{Routed, SessionDelivery, SessionRouter};
pub use role::{Promotion, RoleMachine};
pub use membership::{ClusterView, MemberStatus, ReplicationStream};
pub use management::{HaAttributes, ManagementAgent, ManagementRequest, ManagementStatus};
pub use subscription::ReplicatingSubscription;
pub use consumer::{ConsumerFactories, NormalConsumer, QueueConsumer, QueueConsumerFactory};
pub use backup::{Backup, Mirror, MirrorState};
pub use ha_broker::HaBroker;
pub use node::{ClusterNode, NodeStatus, QueueStatus};
