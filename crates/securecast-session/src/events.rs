//! Session events for any number of observers

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::connection::RemoteTrackInfo;
use crate::session::state::SessionState;

/// Something observable happened to a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The data channel to `peer_id` is open
    Connected {
        peer_id: String,
        device_name: Option<String>,
    },

    /// The session with `peer_id` ended
    Disconnected {
        peer_id: String,
        reason: Option<String>,
    },

    StateChanged {
        peer_id: String,
        from: SessionState,
        to: SessionState,
    },

    /// `peer_id` started sending a media track
    RemoteTrack {
        peer_id: String,
        track: RemoteTrackInfo,
    },

    RemoteTrackEnded { peer_id: String, track_id: String },

    /// A failure that no caller was waiting for
    Error {
        peer_id: Option<String>,
        message: String,
    },
}

impl SessionEvent {
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            SessionEvent::Connected { peer_id, .. }
            | SessionEvent::Disconnected { peer_id, .. }
            | SessionEvent::StateChanged { peer_id, .. }
            | SessionEvent::RemoteTrack { peer_id, .. }
            | SessionEvent::RemoteTrackEnded { peer_id, .. } => Some(peer_id),
            SessionEvent::Error { peer_id, .. } => peer_id.as_deref(),
        }
    }
}

/// Broadcast hub for [`SessionEvent`]s
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to current subscribers; dropped when nobody listens
    pub fn publish(&self, event: SessionEvent) {
        trace!("Publishing {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
