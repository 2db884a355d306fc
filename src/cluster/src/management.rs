//! Management surface for the HA broker.
//!
//! Operators drive the cluster through three methods: `promote`,
//! `setClientAddresses` and `setBrokerAddresses`. The broker publishes its
//! status and addresses as attributes that monitors can read or watch.

use serde::Serialize;
use tokio::sync::watch;

pub const METHOD_PROMOTE: &str = "promote";
pub const METHOD_SET_CLIENT_ADDRESSES: &str = "setClientAddresses";
pub const METHOD_SET_BROKER_ADDRESSES: &str = "setBrokerAddresses";

// Status codes
pub const STATUS_OK: u32 = 0;
pub const STATUS_UNKNOWN_METHOD: u32 = 2;
pub const STATUS_PARAMETER_INVALID: u32 = 4;
pub const STATUS_EXCEPTION: u32 = 7;

/// Attributes published by the HA broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HaAttributes {
    pub member_id: String,
    pub status: String,
    pub client_addresses: String,
    pub broker_addresses: String,
}

/// A management method call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementRequest {
    Promote,
    SetClientAddresses(String),
    SetBrokerAddresses(String),
}

impl ManagementRequest {
    pub fn parse(method: &str, argument: &str) -> Result<Self, ManagementStatus> {
        match method {
            METHOD_PROMOTE => Ok(ManagementRequest::Promote),
            METHOD_SET_CLIENT_ADDRESSES => Ok(ManagementRequest::SetClientAddresses(argument.to_string())),
            METHOD_SET_BROKER_ADDRESSES => Ok(ManagementRequest::SetBrokerAddresses(argument.to_string())),
            other => Err(ManagementStatus::UnknownMethod(other.to_string())),
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            ManagementRequest::Promote => METHOD_PROMOTE,
            ManagementRequest::SetClientAddresses(_) => METHOD_SET_CLIENT_ADDRESSES,
            ManagementRequest::SetBrokerAddresses(_) => METHOD_SET_BROKER_ADDRESSES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementStatus {
    Ok,
    UnknownMethod(String),
    InvalidArgument(String),
    Failed(String),
}

impl ManagementStatus {
    pub fn code(&self) -> u32 {
        match self {
            ManagementStatus::Ok => STATUS_OK,
            ManagementStatus::UnknownMethod(_) => STATUS_UNKNOWN_METHOD,
            ManagementStatus::InvalidArgument(_) => STATUS_PARAMETER_INVALID,
            ManagementStatus::Failed(_) => STATUS_EXCEPTION,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ManagementStatus::Ok)
    }

    pub fn text(&self) -> String {
        match self {
            ManagementStatus::Ok => "OK".to_string(),
            ManagementStatus::UnknownMethod(method) => format!("Unknown method: {}", method),
            ManagementStatus::InvalidArgument(reason) => reason.clone(),
            ManagementStatus::Failed(reason) => reason.clone(),
        }
    }
}

/// Holds the published attributes of this broker
pub struct ManagementAgent {
    attributes: watch::Sender<HaAttributes>,
}

impl ManagementAgent {
    pub fn new(member_id: &str) -> Self {
        let (attributes, _) = watch::channel(HaAttributes {
            member_id: member_id.to_string(),
            status: String::new(),
            client_addresses: String::new(),
            broker_addresses: String::new(),
        });
        ManagementAgent { attributes }
    }

    pub fn publish(&self, attributes: HaAttributes) {
        self.attributes.send_replace(attributes);
    }

    pub fn attributes(&self) -> HaAttributes {
        self.attributes.borrow().clone()
    }

    /// Watch attribute changes
    pub fn subscribe(&self) -> watch::Receiver<HaAttributes> {
        self.attributes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_methods() {
        assert_eq!(ManagementRequest::parse("promote", ""), Ok(ManagementRequest::Promote));
        assert_eq!(
            ManagementRequest::parse("setClientAddresses", "amqp:tcp:x:1"),
            Ok(ManagementRequest::SetClientAddresses("amqp:tcp:x:1".to_string()))
        );
        let err = ManagementRequest::parse("demote", "").unwrap_err();
        assert_eq!(err.code(), STATUS_UNKNOWN_METHOD);
        assert!(err.text().contains("demote"));
    }

    #[tokio::test]
    async fn test_publish_notifies_watchers() {
        let agent = ManagementAgent::new("a");
        let mut rx = agent.subscribe();

        let mut attributes = agent.attributes();
        attributes.status = "primary".to_string();
        agent.publish(attributes);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().status, "primary");
        assert_eq!(agent.attributes().member_id, "a");
    }
}
