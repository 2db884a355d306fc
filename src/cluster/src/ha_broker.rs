//! The HA broker: role, addresses, membership view and backup machinery
//! behind a single lock.
//!
//! Every management call and every role transition takes the same lock, so
//! concurrent calls are applied one after another. The lock is never held
//! while waiting on the transport.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{Mutex, MutexGuard};

use crate::backup::Backup;
use crate::config::HaSettings;
use crate::consumer::ConsumerFactories;
use crate::error::{AdmissionError, HaError};
use crate::frame::Announcement;
use crate::management::{HaAttributes, ManagementAgent, ManagementRequest, ManagementStatus};
use crate::membership::ClusterView;
use crate::role::{Promotion, RoleMachine};
use crate::types::{ConnectionKind, MemberId, Role};
use crate::url::Url;

pub struct HaState {
    pub role: RoleMachine,
    pub client_url: Url,
    pub broker_url: Url,
    pub view: ClusterView,
    /// Present only while the broker is a backup
    pub backup: Option<Backup>,
}

impl HaState {
    /// Backup started building mirrors. Returns `true` if the role changed.
    pub fn enter_catchup(&mut self) -> bool {
        match self.role.begin_catchup() {
            Ok(changed) => {
                self.view.set_local_role(self.role.role());
                changed
            }
            Err(_) => false,
        }
    }

    /// All mirrors ready. Returns `true` if the role changed.
    pub fn leave_catchup(&mut self) -> bool {
        match self.role.catchup_complete() {
            Ok(changed) => {
                self.view.set_local_role(self.role.role());
                changed
            }
            Err(_) => false,
        }
    }
}

pub struct HaBroker {
    member_id: MemberId,
    state: Mutex<HaState>,
    agent: Arc<ManagementAgent>,
    consumers: ConsumerFactories,
}

impl HaBroker {
    /// Start HA in the BACKUP role.
    ///
    /// Fails if management is disabled or either address list is malformed.
    pub fn new(settings: &HaSettings, agent: Option<Arc<ManagementAgent>>) -> Result<Self, HaError> {
        let agent = match agent {
            Some(agent) if settings.management_enabled => agent,
            _ => return Err(HaError::ManagementDisabled),
        };

        let broker_url = Url::parse_for(&settings.broker_url, "ha-broker-url")?;
        let client_url = Url::parse_for(settings.effective_client_url(), "ha-client-url")?;
        let member_id = MemberId::new(&settings.node_id);

        let mut consumers = ConsumerFactories::new();
        consumers.register_replication();

        let state = HaState {
            role: RoleMachine::new(),
            client_url,
            broker_url: broker_url.clone(),
            view: ClusterView::new(member_id.clone()),
            backup: Some(Backup::new(member_id.clone(), broker_url)),
        };

        agent.publish(attributes(&member_id, &state));
        info!("HA broker {} started as {}", member_id, Role::Backup);

        Ok(HaBroker {
            member_id,
            state: Mutex::new(state),
            agent,
            consumers,
        })
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    pub fn agent(&self) -> &Arc<ManagementAgent> {
        &self.agent
    }

    pub fn consumers(&self) -> &ConsumerFactories {
        &self.consumers
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, HaState> {
        self.state.lock().await
    }

    pub async fn role(&self) -> Role {
        self.state.lock().await.role.role()
    }

    pub async fn client_url(&self) -> Url {
        self.state.lock().await.client_url.clone()
    }

    pub async fn broker_url(&self) -> Url {
        self.state.lock().await.broker_url.clone()
    }

    pub fn attributes(&self) -> HaAttributes {
        self.agent.attributes()
    }

    pub async fn admit(&self, kind: ConnectionKind) -> Result<(), AdmissionError> {
        self.state.lock().await.view.admit(kind)
    }

    pub async fn admission_changes(&self) -> u32 {
        self.state.lock().await.view.admission_changes()
    }

    /// Make this broker the primary.
    pub async fn promote(&self) -> Promotion {
        let mut state = self.state.lock().await;
        self.promote_locked(&mut state)
    }

    fn promote_locked(&self, state: &mut HaState) -> Promotion {
        if state.role.role().is_primary() {
            info!("Promote on {}: already primary", self.member_id);
            return Promotion::AlreadyPrimary;
        }

        // Stop consuming replication and drop the mirrors' bookkeeping;
        // the mirrored queues stay and become the primary's queues.
        if let Some(backup) = state.backup.take() {
            let mirrors = backup.mirrors().count();
            info!("Backup stopped, {} mirrored queues taken over", mirrors);
        }
        state.view.admit_clients();
        let promotion = state.role.promote();
        state.view.set_local_role(Role::Primary);
        self.publish(state);
        info!("Broker {} promoted to primary", self.member_id);
        promotion
    }

    /// Apply a management call.
    pub async fn manage(&self, request: ManagementRequest) -> ManagementStatus {
        let mut state = self.state.lock().await;
        match request {
            ManagementRequest::Promote => {
                self.promote_locked(&mut state);
                ManagementStatus::Ok
            }
            ManagementRequest::SetClientAddresses(addresses) => {
                match Url::parse_for(&addresses, "setClientAddresses") {
                    Ok(url) => {
                        info!("Client addresses set to {}", url);
                        state.client_url = url;
                        self.publish(&state);
                        ManagementStatus::Ok
                    }
                    Err(e) => {
                        warn!("{}", e);
                        ManagementStatus::InvalidArgument(e.to_string())
                    }
                }
            }
            ManagementRequest::SetBrokerAddresses(addresses) => {
                match Url::parse_for(&addresses, "setBrokerAddresses") {
                    Ok(url) => {
                        info!("Broker addresses set to {}", url);
                        if let Some(backup) = state.backup.as_mut() {
                            backup.set_url(url.clone());
                        }
                        state.broker_url = url;
                        self.publish(&state);
                        ManagementStatus::Ok
                    }
                    Err(e) => {
                        warn!("{}", e);
                        ManagementStatus::InvalidArgument(e.to_string())
                    }
                }
            }
        }
    }

    /// Parse and apply a management call by method name.
    pub async fn handle_method(&self, method: &str, argument: &str) -> ManagementStatus {
        match ManagementRequest::parse(method, argument) {
            Ok(request) => self.manage(request).await,
            Err(status) => {
                warn!("Rejected management call: {}", status.text());
                status
            }
        }
    }

    pub(crate) fn publish(&self, state: &HaState) {
        self.agent.publish(attributes(&self.member_id, state));
    }

    pub(crate) fn announcement(state: &HaState, queues: Vec<String>) -> Announcement {
        Announcement {
            role: state.role.role(),
            client_addresses: state.client_url.clone(),
            broker_addresses: state.broker_url.clone(),
            queues,
        }
    }
}

fn attributes(member_id: &MemberId, state: &HaState) -> HaAttributes {
    HaAttributes {
        member_id: member_id.to_string(),
        status: state.role.role().to_string(),
        client_addresses: state.client_url.to_string(),
        broker_addresses: state.broker_url.to_string(),
    }
}
