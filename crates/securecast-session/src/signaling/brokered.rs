//! Brokered signaling through a relay

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::relay::{RelayConnector, RelayFrame, RelaySender};
use super::{CandidateRecord, EnvelopeKind, SignalingEnvelope, SignalingTransport};
use crate::config::SessionConfig;
use crate::connection::ConnectionFactory;
use crate::events::SessionEvent;
use crate::identity::DeviceIdentity;
use crate::session::SessionMachine;
use crate::{Error, Result};

/// Transport that forwards envelopes and late candidates through a relay
pub struct BrokeredTransport {
    local_id: String,
    outbound: Mutex<Option<RelaySender>>,
}

impl BrokeredTransport {
    pub fn new(local_id: impl Into<String>, outbound: RelaySender) -> Self {
        Self {
            local_id: local_id.into(),
            outbound: Mutex::new(Some(outbound)),
        }
    }

    fn send(&self, frame: RelayFrame) -> Result<()> {
        let outbound = self.outbound.lock();
        let sender = outbound
            .as_ref()
            .ok_or_else(|| Error::RelayError("relay connection is closed".to_string()))?;
        sender
            .send(frame)
            .map_err(|_| Error::RelayError("relay connection is closed".to_string()))
    }
}

#[async_trait]
impl SignalingTransport for BrokeredTransport {
    fn name(&self) -> &'static str {
        "brokered"
    }

    fn supports_trickle(&self) -> bool {
        true
    }

    async fn publish(&self, envelope: &SignalingEnvelope, recipient: Option<&str>) -> Result<()> {
        let to = recipient.ok_or_else(|| {
            Error::RelayError(format!("{} envelope has no recipient", envelope.kind))
        })?;
        debug!("Relaying {} to {}", envelope.kind, to);
        self.send(RelayFrame::Envelope {
            to: to.to_string(),
            envelope: envelope.clone(),
        })
    }

    async fn trickle(&self, recipient: &str, candidate: &CandidateRecord) -> Result<()> {
        self.send(RelayFrame::Candidate {
            from: self.local_id.clone(),
            to: recipient.to_string(),
            candidate: candidate.clone(),
        })
    }

    async fn shutdown(&self) {
        let Some(sender) = self.outbound.lock().take() else {
            return;
        };
        let _ = sender.send(RelayFrame::Disconnect {
            device_id: self.local_id.clone(),
        });
    }
}

/// A session machine wired to a relay
///
/// Incoming offers are accepted automatically, incoming answers complete
/// the matching pending offer and trickled candidates are applied as they
/// arrive.
pub struct BrokeredSignaling {
    machine: SessionMachine,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokeredSignaling {
    /// Register with the relay under a fresh identity and start the pump
    pub async fn start(
        config: SessionConfig,
        factory: Arc<dyn ConnectionFactory>,
        connector: &dyn RelayConnector,
    ) -> Result<Self> {
        let identity = DeviceIdentity::generate(config.device_name.as_deref());
        Self::start_with_identity(config, identity, factory, connector).await
    }

    /// # Errors
    ///
    /// `RelayError` when registration fails or exceeds the relay connect
    /// timeout, plus any construction error of [`SessionMachine`].
    pub async fn start_with_identity(
        config: SessionConfig,
        identity: DeviceIdentity,
        factory: Arc<dyn ConnectionFactory>,
        connector: &dyn RelayConnector,
    ) -> Result<Self> {
        config.validate()?;

        let timeout = config.relay_connect_timeout();
        let relay = tokio::time::timeout(timeout, connector.connect(&identity))
            .await
            .map_err(|_| {
                Error::RelayError(format!(
                    "registration timed out after {}ms",
                    timeout.as_millis()
                ))
            })??;
        let (outbound, inbound, mut tasks) = relay.into_parts();

        let transport = Arc::new(BrokeredTransport::new(&identity.device_id, outbound));
        let machine =
            match SessionMachine::with_identity(config, identity, factory, transport.clone()) {
                Ok(machine) => machine,
                Err(e) => {
                    transport.shutdown().await;
                    for task in tasks {
                        task.abort();
                    }
                    return Err(e);
                }
            };

        tasks.push(tokio::spawn(run_relay_pump(machine.clone(), inbound)));
        info!(
            "Brokered signaling started for {}",
            machine.identity().device_id
        );

        Ok(Self {
            machine,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn machine(&self) -> &SessionMachine {
        &self.machine
    }

    /// Offer a session to `peer_id` and wait for its channel to open
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when a session with `peer_id` exists,
    /// `HandshakeTimeout` when the channel does not open in time.
    #[instrument(skip(self))]
    pub async fn connect(&self, peer_id: &str) -> Result<()> {
        if peer_id == self.machine.identity().device_id {
            return Err(Error::InvalidOffer(
                "cannot connect to this device itself".to_string(),
            ));
        }
        if self.machine.registry().contains(peer_id).await {
            return Err(Error::AlreadyExists(peer_id.to_string()));
        }

        self.machine.offer_to(Some(peer_id)).await?;
        self.machine.wait_open(peer_id).await
    }

    /// Stop the pump, close every session and leave the relay; idempotent
    pub async fn shutdown(&self) {
        self.machine.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for BrokeredSignaling {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn run_relay_pump(machine: SessionMachine, mut inbound: mpsc::UnboundedReceiver<RelayFrame>) {
    while let Some(frame) = inbound.recv().await {
        match frame {
            RelayFrame::Envelope { envelope, .. } => {
                let machine = machine.clone();
                tokio::spawn(async move {
                    let from = envelope.device_id.clone();
                    let kind = envelope.kind;
                    let outcome = match kind {
                        EnvelopeKind::Offer => machine.accept(envelope).await.map(|_| ()),
                        EnvelopeKind::Answer => machine.complete_answer(envelope).await.map(|_| ()),
                    };
                    if let Err(e) = outcome {
                        warn!("Failed to handle relayed {} from {}: {}", kind, from, e);
                        machine.events().publish(SessionEvent::Error {
                            peer_id: Some(from),
                            message: e.to_string(),
                        });
                    }
                });
            }
            RelayFrame::Candidate { from, candidate, .. } => {
                machine.add_remote_candidate(&from, candidate).await;
            }
            RelayFrame::Disconnect { device_id } => {
                debug!("{} left the relay", device_id);
                machine.peer_left(&device_id).await;
            }
            RelayFrame::Register { .. } => {}
        }
    }
    debug!("Relay inbound stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MemoryRelay;

    #[tokio::test]
    async fn test_publish_requires_recipient() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = BrokeredTransport::new("A1", tx);
        let identity = DeviceIdentity::with_id("A1", None);
        let envelope = SignalingEnvelope::new(EnvelopeKind::Offer, &identity, "v=0".into(), vec![]);

        assert!(transport.publish(&envelope, None).await.is_err());
        transport.publish(&envelope, Some("B1")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().recipient(), Some("B1"));
    }

    #[tokio::test]
    async fn test_shutdown_sends_disconnect_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = BrokeredTransport::new("A1", tx);
        transport.shutdown().await;
        transport.shutdown().await;

        assert_eq!(
            rx.recv().await,
            Some(RelayFrame::Disconnect {
                device_id: "A1".to_string()
            })
        );
        assert_eq!(rx.recv().await, None);
        let candidate = CandidateRecord::new("candidate:1", 0, "0");
        assert!(transport.trickle("B1", &candidate).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails_start() {
        let relay = MemoryRelay::new();
        let network = crate::connection::MemoryNetwork::new();
        let identity = DeviceIdentity::with_id("A1", None);

        let _first = BrokeredSignaling::start_with_identity(
            SessionConfig::default(),
            identity.clone(),
            Arc::new(network.clone()),
            &relay,
        )
        .await
        .unwrap();
        let err = BrokeredSignaling::start_with_identity(
            SessionConfig::default(),
            identity,
            Arc::new(network),
            &relay,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Error::RelayError(_)));
    }
}
