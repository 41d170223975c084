//! Error types for peer sessions

use crate::session::state::SessionState;

/// Result type alias using the session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Why a screen share could not start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDenial {
    /// The device has no screen capture capability
    Unsupported,
    /// The user (or platform) declined the capture request
    Declined,
}

impl std::fmt::Display for PermissionDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionDenial::Unsupported => write!(f, "screen capture is not supported"),
            PermissionDenial::Declined => write!(f, "screen capture permission was declined"),
        }
    }
}

/// Errors that can occur while negotiating or operating peer sessions
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Envelope text could not be decoded
    #[error("Malformed signaling envelope: {0}")]
    MalformedEnvelope(String),

    /// The peer connection primitive is unavailable or refused to build a connection
    #[error("Connection setup failed: {0}")]
    ConnectionSetupError(String),

    /// An offer envelope could not be accepted
    #[error("Invalid offer: {0}")]
    InvalidOffer(String),

    /// An answer envelope could not be applied
    #[error("Invalid answer: {0}")]
    InvalidAnswer(String),

    /// The data channel did not open within the handshake window
    #[error("Handshake with {peer_id} timed out after {waited_ms}ms")]
    HandshakeTimeout {
        /// Remote device the handshake was with
        peer_id: String,
        /// Length of the window that elapsed
        waited_ms: u64,
    },

    /// A session for this device already exists
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// No session registered for this device
    #[error("No such session: {0}")]
    NoSuchSession(String),

    /// The session exists but its channel is not open
    #[error("Session {peer_id} is not open (state: {state})")]
    NotOpen {
        /// Remote device
        peer_id: String,
        /// State the session was found in
        state: SessionState,
    },

    /// Screen capture unavailable or refused
    #[error("Permission denied: {0}")]
    PermissionDenied(PermissionDenial),

    /// Registry is at its configured capacity
    #[error("Session limit reached ({0} sessions)")]
    SessionLimit(usize),

    /// A state transition was attempted that the lifecycle does not allow
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// State before the attempted transition
        from: SessionState,
        /// Requested state
        to: SessionState,
    },

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Relay (brokered signaling) error
    #[error("Relay error: {0}")]
    RelayError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::HandshakeTimeout { .. }
                | Error::RelayError(_)
                | Error::ConnectionSetupError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error came from a pasted or relayed envelope
    pub fn is_envelope_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedEnvelope(_) | Error::InvalidOffer(_) | Error::InvalidAnswer(_)
        )
    }

    /// Text suitable for showing to the person driving the handshake
    pub fn user_message(&self) -> String {
        match self {
            Error::MalformedEnvelope(_) => {
                "The connection text could not be read. Copy the entire text block again, \
                 including the first and last braces, and paste it unchanged."
                    .to_string()
            }
            Error::InvalidOffer(reason) => format!(
                "This is not a usable connection offer ({}). Ask the other device to create a new offer.",
                reason
            ),
            Error::InvalidAnswer(reason) => format!(
                "This is not a usable answer for the pending offer ({}). Paste the answer produced for your latest offer.",
                reason
            ),
            Error::HandshakeTimeout { .. } => {
                "The connection attempt timed out. Start over with a new offer on both devices."
                    .to_string()
            }
            Error::AlreadyExists(peer) => {
                format!("Already connected or connecting to {}.", peer)
            }
            Error::PermissionDenied(PermissionDenial::Unsupported) => {
                "Screen sharing is not supported on this device.".to_string()
            }
            Error::PermissionDenied(PermissionDenial::Declined) => {
                "Screen sharing permission was declined. Allow screen capture and try again."
                    .to_string()
            }
            Error::ConnectionSetupError(_) => {
                "Peer connections are unavailable on this device.".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");

        let err = Error::NotOpen {
            peer_id: "B1".to_string(),
            state: SessionState::OfferCreated,
        };
        assert_eq!(err.to_string(), "Session B1 is not open (state: offer_created)");
    }

    #[test]
    fn test_error_is_retryable() {
        let timeout = Error::HandshakeTimeout {
            peer_id: "B1".to_string(),
            waited_ms: 30_000,
        };
        assert!(timeout.is_retryable());
        assert!(Error::RelayError("closed".to_string()).is_retryable());
        assert!(!Error::MalformedEnvelope("eof".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_envelope_error() {
        assert!(Error::MalformedEnvelope("x".to_string()).is_envelope_error());
        assert!(Error::InvalidAnswer("x".to_string()).is_envelope_error());
        assert!(!Error::NoSuchSession("x".to_string()).is_envelope_error());
    }

    #[test]
    fn test_user_message_distinguishes_permission_denials() {
        let unsupported = Error::PermissionDenied(PermissionDenial::Unsupported).user_message();
        let declined = Error::PermissionDenied(PermissionDenial::Declined).user_message();
        assert!(unsupported.contains("not supported"));
        assert!(declined.contains("declined"));
        assert_ne!(unsupported, declined);
    }

    #[test]
    fn test_user_message_asks_to_recopy_malformed_text() {
        let msg = Error::MalformedEnvelope("expected value at line 1".to_string()).user_message();
        assert!(msg.contains("Copy the entire text block"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::IoError(_)));
    }
}
