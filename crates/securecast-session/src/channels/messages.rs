//! Control messages exchanged over the session data channel

use serde::{Deserialize, Serialize};

use crate::connection::SdpKind;
use crate::identity::now_millis;
use crate::{Error, Result};

/// Maximum encoded message size (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Reply to a screen share request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareResponseStatus {
    Accepted,
    Rejected,
}

/// JSON message on the data channel, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Free-form text
    CustomMessage {
        message: String,
        #[serde(default)]
        timestamp: u64,
    },

    /// Ask the remote to share its screen
    ScreenShareRequest {
        #[serde(default)]
        timestamp: u64,
    },

    ScreenShareResponse {
        status: ShareResponseStatus,
        #[serde(default)]
        timestamp: u64,
    },

    /// Sender attached a screen track
    ScreenShareStarted {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(
            rename = "trackCount",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        track_count: Option<u32>,
        #[serde(default)]
        timestamp: u64,
    },

    /// Sender detached its screen track
    ScreenShareStopped {
        #[serde(default)]
        timestamp: u64,
    },

    /// Renegotiation descriptor carried in-band once the session is open
    SessionDescription {
        kind: SdpKind,
        sdp: String,
        #[serde(default)]
        timestamp: u64,
    },

    /// Ask the side that made the handshake offer to send a fresh one
    RenegotiationRequest {
        /// The requester is adding an outbound track
        #[serde(rename = "addsTrack", default)]
        adds_track: bool,
        #[serde(default)]
        timestamp: u64,
    },
}

impl ControlMessage {
    pub fn custom(message: impl Into<String>) -> Self {
        ControlMessage::CustomMessage {
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    pub fn screen_share_request() -> Self {
        ControlMessage::ScreenShareRequest {
            timestamp: now_millis(),
        }
    }

    pub fn screen_share_response(accepted: bool) -> Self {
        ControlMessage::ScreenShareResponse {
            status: if accepted {
                ShareResponseStatus::Accepted
            } else {
                ShareResponseStatus::Rejected
            },
            timestamp: now_millis(),
        }
    }

    pub fn screen_share_started(stream_id: impl Into<String>, track_count: u32) -> Self {
        ControlMessage::ScreenShareStarted {
            stream_id: stream_id.into(),
            track_count: Some(track_count),
            timestamp: now_millis(),
        }
    }

    pub fn screen_share_stopped() -> Self {
        ControlMessage::ScreenShareStopped {
            timestamp: now_millis(),
        }
    }

    pub fn session_description(kind: SdpKind, sdp: impl Into<String>) -> Self {
        ControlMessage::SessionDescription {
            kind,
            sdp: sdp.into(),
            timestamp: now_millis(),
        }
    }

    pub fn renegotiation_request(adds_track: bool) -> Self {
        ControlMessage::RenegotiationRequest {
            adds_track,
            timestamp: now_millis(),
        }
    }

    /// Wire value of the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::CustomMessage { .. } => "custom_message",
            ControlMessage::ScreenShareRequest { .. } => "screen_share_request",
            ControlMessage::ScreenShareResponse { .. } => "screen_share_response",
            ControlMessage::ScreenShareStarted { .. } => "screen_share_started",
            ControlMessage::ScreenShareStopped { .. } => "screen_share_stopped",
            ControlMessage::SessionDescription { .. } => "session_description",
            ControlMessage::RenegotiationRequest { .. } => "renegotiation_request",
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            ControlMessage::CustomMessage { timestamp, .. }
            | ControlMessage::ScreenShareRequest { timestamp }
            | ControlMessage::ScreenShareResponse { timestamp, .. }
            | ControlMessage::ScreenShareStarted { timestamp, .. }
            | ControlMessage::ScreenShareStopped { timestamp }
            | ControlMessage::SessionDescription { timestamp, .. }
            | ControlMessage::RenegotiationRequest { timestamp, .. } => *timestamp,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::SerializationError(format!("Failed to encode message: {}", e)))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::SerializationError(format!("Failed to decode message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_message_wire_format() {
        let json = ControlMessage::CustomMessage {
            message: "hello".to_string(),
            timestamp: 42,
        }
        .to_json()
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"custom_message","message":"hello","timestamp":42}"#
        );
    }

    #[test]
    fn test_screen_share_started_uses_camel_case_fields() {
        let json = ControlMessage::screen_share_started("stream-1", 1).to_json().unwrap();
        assert!(json.contains(r#""type":"screen_share_started""#));
        assert!(json.contains(r#""streamId":"stream-1""#));
        assert!(json.contains(r#""trackCount":1"#));
    }

    #[test]
    fn test_started_without_track_count() {
        let msg =
            ControlMessage::from_json(r#"{"type":"screen_share_started","streamId":"s","timestamp":7}"#)
                .unwrap();
        assert_eq!(
            msg,
            ControlMessage::ScreenShareStarted {
                stream_id: "s".to_string(),
                track_count: None,
                timestamp: 7,
            }
        );
        assert!(!msg.to_json().unwrap().contains("trackCount"));
    }

    #[test]
    fn test_screen_share_response_status() {
        let accepted = ControlMessage::screen_share_response(true).to_json().unwrap();
        let rejected = ControlMessage::screen_share_response(false).to_json().unwrap();
        assert!(accepted.contains(r#""status":"accepted""#));
        assert!(rejected.contains(r#""status":"rejected""#));
    }

    #[test]
    fn test_session_description_kind() {
        let msg = ControlMessage::session_description(SdpKind::Answer, "v=0");
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""kind":"answer""#));
        assert_eq!(ControlMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_kind_matches_type_tag() {
        let messages = [
            ControlMessage::custom("x"),
            ControlMessage::screen_share_request(),
            ControlMessage::screen_share_response(true),
            ControlMessage::screen_share_started("s", 1),
            ControlMessage::screen_share_stopped(),
            ControlMessage::session_description(SdpKind::Offer, "v=0"),
            ControlMessage::renegotiation_request(true),
        ];
        for msg in messages {
            let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
            assert_eq!(value["type"], msg.kind());
        }
    }

    #[test]
    fn test_timestamp_defaults_when_missing() {
        let msg = ControlMessage::from_json(r#"{"type":"screen_share_stopped"}"#).unwrap();
        assert_eq!(msg.timestamp(), 0);
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(ControlMessage::from_json(r#"{"type":"file_transfer","timestamp":1}"#).is_err());
    }
}
