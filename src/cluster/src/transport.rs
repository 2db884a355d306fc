//! Totally ordered group transport.
//!
//! Every member sees the same frames in the same order, including its own.
//! `LocalBus` provides that for members living in one process.

use std::collections::BTreeMap;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;
use crate::frame::SessionFrame;
use crate::types::MemberId;

/// Position of a frame in the group's delivery order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeliveryToken(pub u64);

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Deliver {
        from: MemberId,
        token: DeliveryToken,
        frame: SessionFrame,
    },
    Membership {
        member: MemberId,
        joined: bool,
    },
}

#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Join the group. Events for the member arrive on the returned channel,
    /// starting with a join notice for every current member.
    async fn join(&self, member: &MemberId) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    async fn leave(&self, member: &MemberId);

    /// Submit a frame for delivery to every member. `Ok` means the frame
    /// has entered the total order.
    async fn broadcast(&self, from: &MemberId, frame: SessionFrame) -> Result<DeliveryToken, TransportError>;

    async fn members(&self) -> Vec<MemberId>;
}

struct BusState {
    sequence: u64,
    members: BTreeMap<MemberId, mpsc::UnboundedSender<TransportEvent>>,
}

impl BusState {
    /// Send to everyone, dropping members whose receiver is gone.
    fn fan_out(&mut self, event: TransportEvent) -> Vec<MemberId> {
        let mut gone = Vec::new();
        for (member, tx) in &self.members {
            if tx.send(event.clone()).is_err() {
                gone.push(member.clone());
            }
        }
        for member in &gone {
            self.members.remove(member);
        }
        gone
    }

    fn depart(&mut self, member: &MemberId) {
        let mut pending = vec![member.clone()];
        while let Some(member) = pending.pop() {
            info!("Member {} left the group", member);
            pending.extend(self.fan_out(TransportEvent::Membership { member, joined: false }));
        }
    }
}

/// In-process transport; the state lock is the sequencer.
pub struct LocalBus {
    state: Mutex<BusState>,
}

impl LocalBus {
    pub fn new() -> Self {
        LocalBus {
            state: Mutex::new(BusState {
                sequence: 0,
                members: BTreeMap::new(),
            }),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameTransport for LocalBus {
    async fn join(&self, member: &MemberId) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let mut state = self.state.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();

        for existing in state.members.keys() {
            let _ = tx.send(TransportEvent::Membership {
                member: existing.clone(),
                joined: true,
            });
        }
        state.members.insert(member.clone(), tx);
        let gone = state.fan_out(TransportEvent::Membership {
            member: member.clone(),
            joined: true,
        });
        for departed in gone {
            state.depart(&departed);
        }

        info!("Member {} joined the group ({} members)", member, state.members.len());
        Ok(rx)
    }

    async fn leave(&self, member: &MemberId) {
        let mut state = self.state.lock().await;
        if state.members.remove(member).is_some() {
            state.depart(member);
        }
    }

    async fn broadcast(&self, from: &MemberId, frame: SessionFrame) -> Result<DeliveryToken, TransportError> {
        let mut state = self.state.lock().await;
        if !state.members.contains_key(from) {
            return Err(TransportError::NotJoined(from.clone()));
        }

        state.sequence += 1;
        let token = DeliveryToken(state.sequence);
        debug!("Frame {} from {} sequenced as {}", frame.body.name(), from, token.0);

        let gone = state.fan_out(TransportEvent::Deliver {
            from: from.clone(),
            token,
            frame,
        });
        for departed in gone {
            state.depart(&departed);
        }
        Ok(token)
    }

    async fn members(&self) -> Vec<MemberId> {
        self.state.lock().await.members.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBody;

    fn ping() -> SessionFrame {
        SessionFrame::control(FrameBody::SessionPing)
    }

    #[tokio::test]
    async fn test_join_announces_members() {
        let bus = LocalBus::new();
        let a = MemberId::new("a");
        let b = MemberId::new("b");

        let mut rx_a = bus.join(&a).await.unwrap();
        let mut rx_b = bus.join(&b).await.unwrap();

        // a sees itself then b
        for expected in [&a, &b] {
            match rx_a.recv().await.unwrap() {
                TransportEvent::Membership { member, joined } => {
                    assert_eq!(&member, expected);
                    assert!(joined);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        // b sees a (existing) then itself
        for expected in [&a, &b] {
            match rx_b.recv().await.unwrap() {
                TransportEvent::Membership { member, .. } => assert_eq!(&member, expected),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(bus.members().await, vec![a, b]);
    }

    #[tokio::test]
    async fn test_total_order_includes_sender() {
        let bus = LocalBus::new();
        let a = MemberId::new("a");
        let b = MemberId::new("b");
        let mut rx_a = bus.join(&a).await.unwrap();
        let mut rx_b = bus.join(&b).await.unwrap();

        let t1 = bus.broadcast(&a, ping()).await.unwrap();
        let t2 = bus.broadcast(&b, ping()).await.unwrap();
        assert!(t1 < t2);

        for rx in [&mut rx_a, &mut rx_b] {
            let mut tokens = Vec::new();
            while let Ok(event) = rx.try_recv() {
                if let TransportEvent::Deliver { token, .. } = event {
                    tokens.push(token);
                }
            }
            assert_eq!(tokens, vec![t1, t2]);
        }
    }

    #[tokio::test]
    async fn test_broadcast_requires_membership() {
        let bus = LocalBus::new();
        let a = MemberId::new("a");
        assert_eq!(
            bus.broadcast(&a, ping()).await.unwrap_err(),
            TransportError::NotJoined(a.clone())
        );

        let _rx = bus.join(&a).await.unwrap();
        assert!(bus.broadcast(&a, ping()).await.is_ok());
        bus.leave(&a).await;
        assert!(bus.broadcast(&a, ping()).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_receiver_counts_as_departure() {
        let bus = LocalBus::new();
        let a = MemberId::new("a");
        let b = MemberId::new("b");
        let mut rx_a = bus.join(&a).await.unwrap();
        let rx_b = bus.join(&b).await.unwrap();
        drop(rx_b);

        bus.broadcast(&a, ping()).await.unwrap();
        assert_eq!(bus.members().await, vec![a.clone()]);

        let mut departed = false;
        while let Ok(event) = rx_a.try_recv() {
            if let TransportEvent::Membership { member, joined: false } = event {
                assert_eq!(member, b);
                departed = true;
            }
        }
        assert!(departed);
    }
}
