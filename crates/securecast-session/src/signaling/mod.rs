//! Signaling: envelopes and the transports that carry them
//!
//! The session machine hands every envelope it produces to a
//! [`SignalingTransport`]. With [`ManualTransport`] the envelope text is
//! returned to the caller, who moves it to the other device by hand. With
//! [`BrokeredTransport`] it is forwarded through a relay, which also carries
//! candidates discovered after the envelope went out.

pub mod brokered;
pub mod envelope;
pub mod manual;
pub mod relay;
pub mod websocket;

use async_trait::async_trait;

use crate::Result;

pub use brokered::{BrokeredSignaling, BrokeredTransport};
pub use envelope::{CandidateRecord, EnvelopeKind, SignalingEnvelope};
pub use manual::ManualTransport;
pub use relay::{MemoryRelay, RelayConnector, RelayFrame, RelaySession};
pub use websocket::{RelayServer, RelayServerHandle, WebSocketRelay};

/// Delivery strategy for handshake envelopes
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether candidates found after the envelope was sent can still be delivered
    fn supports_trickle(&self) -> bool;

    /// Deliver an envelope; `recipient` is unknown for a manual offer
    async fn publish(&self, envelope: &SignalingEnvelope, recipient: Option<&str>) -> Result<()>;

    /// Deliver a late candidate to `recipient`
    async fn trickle(&self, recipient: &str, candidate: &CandidateRecord) -> Result<()>;

    /// Release transport resources
    async fn shutdown(&self) {}
}
