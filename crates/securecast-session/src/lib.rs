//! Peer session lifecycle for SecureCast
//!
//! Establishes and manages direct peer-to-peer sessions between two devices
//! without relying on an always-available rendezvous service. Two signaling
//! strategies share one state machine:
//!
//! - **manual**: offers and answers are copyable text blobs the user moves
//!   between devices by any out-of-band means;
//! - **brokered**: a relay forwards envelopes and late candidates.
//!
//! Once a session's data channel is open, typed control messages flow over
//! it and a screen capture track can be attached or detached on demand.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  SessionMachine                                           │
//! │  ├─ SignalingTransport (ManualTransport | Brokered)       │
//! │  ├─ ConnectionFactory  (RtcConnectionFactory | Memory)    │
//! │  ├─ PeerRegistry ── PeerSession per remote device         │
//! │  ├─ DataChannelBus (control messages by type)             │
//! │  ├─ MediaNegotiator (attach / detach, in-band renegotiate)│
//! │  └─ EventHub (connected, disconnected, tracks, errors)    │
//! │                                                           │
//! │  ScreenShare ── ScreenCapture                             │
//! │  BackgroundReconciler (status while backgrounded)         │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use securecast_session::SessionConfig;
//!
//! let config = SessionConfig {
//!     device_name: Some("Laptop".to_string()),
//!     gather_timeout_ms: 2000,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Manual handshake
//!
//! ```no_run
//! use std::sync::Arc;
//! use securecast_session::{RtcConnectionFactory, SessionConfig, SessionMachine};
//!
//! # async fn example(answer_from_user: String) -> securecast_session::Result<()> {
//! let config = SessionConfig::default();
//! let factory = Arc::new(RtcConnectionFactory::new(&config));
//! let machine = SessionMachine::manual(config, factory)?;
//!
//! let offer = machine.create_offer().await?;
//! println!("{}", offer);
//!
//! let peer_id = machine.complete_with_answer(&answer_from_user).await?;
//! machine.bus().send_custom(&peer_id, "hello").await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod identity;
pub mod lifecycle;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use channels::{ControlMessage, DataChannelBus, InboundMessage};
pub use config::{SessionConfig, TurnServerConfig};
pub use connection::{ConnectionFactory, MemoryNetwork, MemoryOptions, RtcConnectionFactory};
pub use error::{Error, PermissionDenial, Result};
pub use events::{EventHub, SessionEvent};
pub use identity::{DeviceIdentity, DeviceInfo};
pub use lifecycle::{AppPhase, BackgroundReconciler, ShareStatus, SharingStatus};
pub use media::{
    LocalVideoTrack, MediaNegotiator, MediaTrack, ScreenCapture, ScreenShare,
    ScreenShareAssociation, SyntheticCapture,
};
pub use peer::{PeerRegistry, PeerSession};
pub use session::{SessionMachine, SessionState};
pub use signaling::{
    BrokeredSignaling, ManualTransport, MemoryRelay, RelayServer, SignalingEnvelope,
    SignalingTransport, WebSocketRelay,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
