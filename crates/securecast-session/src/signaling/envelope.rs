//! Signaling envelope codec
//!
//! An envelope carries one side of a handshake: the session descriptor and
//! the candidates gathered for it. On the manual path the encoded text is
//! copied between devices by hand, so the encoding is pretty-printed JSON
//! with a fixed field order and decoding tolerates whitespace around it.

use serde::{Deserialize, Serialize};

use crate::identity::{now_millis, DeviceIdentity};
use crate::{Error, Result};

/// Which half of the handshake an envelope carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Offer,
    Answer,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeKind::Offer => f.write_str("offer"),
            EnvelopeKind::Answer => f.write_str("answer"),
        }
    }
}

/// One network candidate, passed through to the connection untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub candidate: String,

    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,

    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
}

impl CandidateRecord {
    pub fn new(candidate: impl Into<String>, sdp_mline_index: u16, sdp_mid: &str) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mline_index: Some(sdp_mline_index),
            sdp_mid: Some(sdp_mid.to_string()),
        }
    }
}

/// Signaling message exchanged during a handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub device_id: String,
    pub device_name: String,
    pub sdp: String,
    pub ice_candidates: Vec<CandidateRecord>,
    pub timestamp: u64,
}

impl SignalingEnvelope {
    pub fn new(
        kind: EnvelopeKind,
        identity: &DeviceIdentity,
        sdp: String,
        ice_candidates: Vec<CandidateRecord>,
    ) -> Self {
        Self {
            kind,
            device_id: identity.device_id.clone(),
            device_name: identity.device_name.clone(),
            sdp,
            ice_candidates,
            timestamp: now_millis(),
        }
    }

    /// Encode to copyable text
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::SerializationError(format!("Failed to encode envelope: {}", e)))
    }

    /// Decode text produced by [`encode`](Self::encode) on any device
    pub fn decode(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(Error::MalformedEnvelope("envelope text is empty".to_string()));
        }

        let envelope: SignalingEnvelope = serde_json::from_str(trimmed)
            .map_err(|e| Error::MalformedEnvelope(e.to_string()))?;

        if envelope.device_id.trim().is_empty() {
            return Err(Error::MalformedEnvelope("deviceId is empty".to_string()));
        }
        if envelope.sdp.trim().is_empty() {
            return Err(Error::MalformedEnvelope("sdp is empty".to_string()));
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: EnvelopeKind) -> SignalingEnvelope {
        SignalingEnvelope {
            kind,
            device_id: "A1".to_string(),
            device_name: "Laptop".to_string(),
            sdp: "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n".to_string(),
            ice_candidates: vec![
                CandidateRecord::new(
                    "candidate:1 1 udp 2122260223 192.168.1.20 54321 typ host",
                    0,
                    "0",
                ),
                CandidateRecord {
                    candidate: "candidate:2 1 tcp 1518280447 192.168.1.20 9 typ host".to_string(),
                    sdp_mline_index: None,
                    sdp_mid: None,
                },
            ],
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_round_trip() {
        for kind in [EnvelopeKind::Offer, EnvelopeKind::Answer] {
            let envelope = sample(kind);
            let text = envelope.encode().unwrap();
            assert_eq!(SignalingEnvelope::decode(&text).unwrap(), envelope);
        }
    }

    #[test]
    fn test_wire_format_field_names_and_order() {
        let text = sample(EnvelopeKind::Offer).encode().unwrap();
        let positions: Vec<usize> = [
            "\"type\"",
            "\"deviceId\"",
            "\"deviceName\"",
            "\"sdp\"",
            "\"iceCandidates\"",
            "\"timestamp\"",
        ]
        .iter()
        .map(|key| text.find(key).unwrap_or_else(|| panic!("missing {}", key)))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{}", text);
        assert!(text.contains("\"type\": \"offer\""));
        assert!(text.contains("\"sdpMLineIndex\": 0"));
        assert!(text.contains("\"sdpMid\": \"0\""));
        assert!(text.contains('\n'), "encoding should be pretty-printed");
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let envelope = sample(EnvelopeKind::Answer);
        assert_eq!(envelope.encode().unwrap(), envelope.encode().unwrap());
    }

    #[test]
    fn test_decode_tolerates_surrounding_whitespace() {
        let text = format!("\n\n   {}\n\t ", sample(EnvelopeKind::Offer).encode().unwrap());
        assert!(SignalingEnvelope::decode(&text).is_ok());
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let text = r#"{"type":"answer","deviceId":"B1","deviceName":"Phone","sdp":"v=0",
            "iceCandidates":[],"timestamp":5,"appVersion":"2.1"}"#;
        let envelope = SignalingEnvelope::decode(text).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Answer);
        assert_eq!(envelope.device_id, "B1");
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let err = SignalingEnvelope::decode("not json").unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let text = r#"{"type":"pranswer","deviceId":"B1","deviceName":"Phone","sdp":"v=0","iceCandidates":[],"timestamp":5}"#;
        assert!(matches!(
            SignalingEnvelope::decode(text),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let text = r#"{"type":"offer","deviceId":"B1","sdp":"v=0","iceCandidates":[],"timestamp":5}"#;
        assert!(matches!(
            SignalingEnvelope::decode(text),
            Err(Error::MalformedEnvelope(_))
        ));
        assert!(matches!(
            SignalingEnvelope::decode("   "),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_decode_rejects_empty_device_id() {
        let text = r#"{"type":"offer","deviceId":"","deviceName":"x","sdp":"v=0","iceCandidates":[],"timestamp":5}"#;
        assert!(SignalingEnvelope::decode(text).is_err());
    }

    #[test]
    fn test_large_descriptor_is_accepted() {
        let mut envelope = sample(EnvelopeKind::Offer);
        envelope.sdp = "a=candidate-line\r\n".repeat(20_000);
        let text = envelope.encode().unwrap();
        assert!(text.len() > 300_000);
        assert_eq!(SignalingEnvelope::decode(&text).unwrap(), envelope);
    }
}
