//! Peer connection primitive
//!
//! The session layer never talks to webrtc-rs directly. It drives a
//! [`PeerLink`] obtained from an injected [`ConnectionFactory`] and reacts to
//! the [`LinkEvent`]s the link broadcasts. [`rtc`] provides the real
//! implementation, [`memory`] an in-process one for tests and demos.

pub mod memory;
pub mod rtc;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::media::MediaTrack;
use crate::signaling::CandidateRecord;
use crate::Result;

pub use memory::{GatheringMode, MemoryLink, MemoryNetwork, MemoryOptions, SignalingState};
pub use rtc::RtcConnectionFactory;

/// Capacity of the per-link event channel
pub(crate) const LINK_EVENT_CAPACITY: usize = 256;

/// Description type passed to [`PeerLink::apply_remote_description`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Connection-level state reported by the primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A media track announced by the remote side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub stream_id: String,
    pub kind: String,
}

/// Events emitted by a [`PeerLink`]
#[derive(Clone)]
pub enum LinkEvent {
    /// A local candidate was discovered
    Candidate(CandidateRecord),
    /// Local candidate gathering finished
    GatheringComplete,
    /// Connection state changed
    StateChanged(LinkState),
    /// The negotiated data channel opened
    ChannelOpen(Arc<dyn DataLink>),
    /// Text message received on the data channel
    ChannelMessage(String),
    /// The data channel closed
    ChannelClosed,
    /// The remote side added a media track
    RemoteTrack(RemoteTrackInfo),
    /// A remote media track went away
    RemoteTrackEnded { track_id: String },
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkEvent::Candidate(c) => f.debug_tuple("Candidate").field(&c.candidate).finish(),
            LinkEvent::GatheringComplete => f.write_str("GatheringComplete"),
            LinkEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            LinkEvent::ChannelOpen(dc) => f.debug_tuple("ChannelOpen").field(&dc.label()).finish(),
            LinkEvent::ChannelMessage(m) => {
                f.debug_tuple("ChannelMessage").field(&m.len()).finish()
            }
            LinkEvent::ChannelClosed => f.write_str("ChannelClosed"),
            LinkEvent::RemoteTrack(t) => f.debug_tuple("RemoteTrack").field(&t.track_id).finish(),
            LinkEvent::RemoteTrackEnded { track_id } => f
                .debug_struct("RemoteTrackEnded")
                .field("track_id", track_id)
                .finish(),
        }
    }
}

/// Creates peer links; injected into the session machine
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Check that connections can be built at all
    fn check_available(&self) -> Result<()>;

    /// Build a new, unnegotiated link
    async fn create(&self) -> Result<Arc<dyn PeerLink>>;
}

/// One peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn link_id(&self) -> &str;

    /// Create and apply a local offer, returning its SDP
    async fn create_offer(&self) -> Result<String>;

    /// Create and apply a local answer, returning its SDP
    async fn create_answer(&self) -> Result<String>;

    async fn apply_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()>;

    async fn add_candidate(&self, candidate: &CandidateRecord) -> Result<()>;

    /// Create the negotiated data channel (offering side, before the offer)
    async fn open_channel(&self, label: &str) -> Result<()>;

    /// Add an outbound track, returning an id for [`remove_track`](Self::remove_track)
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<String>;

    async fn remove_track(&self, sender_id: &str) -> Result<()>;

    /// Add a receive-only video slot so the next local offer can carry a
    /// track the remote side is about to add
    async fn reserve_inbound_video(&self) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;

    /// Close the connection and its channels; idempotent
    async fn close(&self) -> Result<()>;
}

/// Reliable ordered text channel over a link
#[async_trait]
pub trait DataLink: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
