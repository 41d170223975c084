//! Manual (copy/paste) signaling

use async_trait::async_trait;
use tracing::debug;

use super::{CandidateRecord, SignalingEnvelope, SignalingTransport};
use crate::Result;

/// Transport where the caller carries the envelope text between devices
///
/// Nothing is sent anywhere: the session machine returns the encoded
/// envelope from `create_offer` / `accept_offer`, and late candidates have no
/// path to the remote side.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualTransport;

#[async_trait]
impl SignalingTransport for ManualTransport {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn supports_trickle(&self) -> bool {
        false
    }

    async fn publish(&self, envelope: &SignalingEnvelope, recipient: Option<&str>) -> Result<()> {
        debug!(
            "{} envelope ready for manual transfer ({} candidates, recipient {:?})",
            envelope.kind,
            envelope.ice_candidates.len(),
            recipient
        );
        Ok(())
    }

    async fn trickle(&self, recipient: &str, candidate: &CandidateRecord) -> Result<()> {
        debug!(
            "No signaling path to {}; discarding late candidate {}",
            recipient, candidate.candidate
        );
        Ok(())
    }
}
