//! Per-peer session record

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::connection::{DataLink, PeerLink, RemoteTrackInfo};
use crate::media::MediaTrack;
use crate::session::state::{HandshakeRole, SessionState};
use crate::{Error, Result};

/// Outbound track attached to a session
#[derive(Clone)]
pub struct OutboundMedia {
    pub track: Arc<dyn MediaTrack>,
    pub sender_id: String,
    pub attached_at: Instant,
}

/// In-band renegotiation bookkeeping; at most one offer in flight
#[derive(Debug, Default)]
pub(crate) struct Renegotiation {
    /// Our offer is waiting for its answer
    pub(crate) offer_outstanding: bool,
    /// Another round was asked for while the offer was outstanding
    pub(crate) pending: bool,
}

/// One remote device with which negotiation started
///
/// The connection and channel handles are owned here and released when the
/// session reaches `failed` or `closed`.
pub struct PeerSession {
    peer_id: RwLock<String>,
    remote_name: RwLock<Option<String>>,
    role: HandshakeRole,
    link: Arc<dyn PeerLink>,
    channel: RwLock<Option<Arc<dyn DataLink>>>,
    outbound: RwLock<Option<OutboundMedia>>,
    inbound: RwLock<Option<RemoteTrackInfo>>,
    renegotiation: Mutex<Renegotiation>,
    state: watch::Sender<SessionState>,
    exchanged: AtomicBool,
    remote_applied: AtomicBool,
    disconnect_announced: AtomicBool,
    created_at: SystemTime,
}

impl PeerSession {
    pub fn new(peer_id: impl Into<String>, role: HandshakeRole, link: Arc<dyn PeerLink>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            peer_id: RwLock::new(peer_id.into()),
            remote_name: RwLock::new(None),
            role,
            link,
            channel: RwLock::new(None),
            outbound: RwLock::new(None),
            inbound: RwLock::new(None),
            renegotiation: Mutex::new(Renegotiation::default()),
            state,
            exchanged: AtomicBool::new(false),
            remote_applied: AtomicBool::new(false),
            disconnect_announced: AtomicBool::new(false),
            created_at: SystemTime::now(),
        }
    }

    pub fn peer_id(&self) -> String {
        self.peer_id.read().clone()
    }

    pub(crate) fn set_peer_id(&self, peer_id: &str) {
        *self.peer_id.write() = peer_id.to_string();
    }

    pub fn remote_name(&self) -> Option<String> {
        self.remote_name.read().clone()
    }

    pub(crate) fn set_remote_name(&self, name: &str) {
        *self.remote_name.write() = Some(name.to_string());
    }

    /// Remote name if known, otherwise the device id
    pub fn display_name(&self) -> String {
        self.remote_name().unwrap_or_else(|| self.peer_id())
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::ChannelOpen
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Move to `to`, returning the previous state
    ///
    /// Re-entering the current state is a no-op. Leaving `channel_open`
    /// drops the outbound attachment.
    pub fn transition(&self, to: SessionState) -> Result<SessionState> {
        let mut outcome = Ok(to);
        self.state.send_if_modified(|current| {
            let from = *current;
            if from == to {
                outcome = Ok(from);
                return false;
            }
            if !from.can_transition_to(to) {
                outcome = Err(Error::InvalidTransition { from, to });
                return false;
            }
            *current = to;
            outcome = Ok(from);
            true
        });

        let from = outcome?;
        if from != to {
            debug!("Peer {} state transition: {} -> {}", self.peer_id(), from, to);
            if to.is_terminal() {
                self.outbound.write().take();
                self.inbound.write().take();
            }
        }
        Ok(from)
    }

    /// Promote `answer_created` to `channel_open` once the channel is present
    ///
    /// Returns true for the single caller that performed the promotion.
    pub(crate) fn promote_if_ready(&self) -> bool {
        let has_channel = self.channel.read().is_some();
        let promoted = self.state.send_if_modified(|current| {
            if *current == SessionState::AnswerCreated && has_channel {
                *current = SessionState::ChannelOpen;
                true
            } else {
                false
            }
        });
        if promoted {
            debug!(
                "Peer {} state transition: {} -> {}",
                self.peer_id(),
                SessionState::AnswerCreated,
                SessionState::ChannelOpen
            );
        }
        promoted
    }

    pub fn channel(&self) -> Option<Arc<dyn DataLink>> {
        self.channel.read().clone()
    }

    pub(crate) fn set_channel(&self, channel: Arc<dyn DataLink>) {
        *self.channel.write() = Some(channel);
    }

    /// Envelope for this session has left the device
    pub(crate) fn mark_exchanged(&self) {
        self.exchanged.store(true, Ordering::SeqCst);
    }

    pub(crate) fn exchanged(&self) -> bool {
        self.exchanged.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_remote_applied(&self) {
        self.remote_applied.store(true, Ordering::SeqCst);
    }

    pub(crate) fn remote_applied(&self) -> bool {
        self.remote_applied.load(Ordering::SeqCst)
    }

    /// True exactly once per session
    pub(crate) fn claim_disconnect(&self) -> bool {
        !self.disconnect_announced.swap(true, Ordering::SeqCst)
    }

    pub fn outbound(&self) -> Option<OutboundMedia> {
        self.outbound.read().clone()
    }

    /// Record an outbound attachment; refused unless the channel is open
    pub(crate) fn set_outbound(&self, media: OutboundMedia) -> Result<()> {
        let state = self.state();
        if state != SessionState::ChannelOpen {
            return Err(Error::NotOpen {
                peer_id: self.peer_id(),
                state,
            });
        }
        *self.outbound.write() = Some(media);
        Ok(())
    }

    pub(crate) fn take_outbound(&self) -> Option<OutboundMedia> {
        self.outbound.write().take()
    }

    pub fn inbound(&self) -> Option<RemoteTrackInfo> {
        self.inbound.read().clone()
    }

    pub(crate) fn set_inbound(&self, track: Option<RemoteTrackInfo>) {
        *self.inbound.write() = track;
    }

    /// Held for the whole of an offer/answer step on this session
    pub(crate) async fn renegotiation(&self) -> MutexGuard<'_, Renegotiation> {
        self.renegotiation.lock().await
    }

    /// Release the channel and connection; idempotent
    pub async fn close(&self) {
        let state = self.state();
        if state != SessionState::Closed {
            if !state.can_transition_to(SessionState::Closed) {
                let _ = self.transition(SessionState::Failed);
            }
            let _ = self.transition(SessionState::Closed);
        }

        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!("Failed to close channel for {}: {}", self.peer_id(), e);
            }
        }
        if let Err(e) = self.link.close().await {
            warn!("Failed to close connection for {}: {}", self.peer_id(), e);
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id())
            .field("role", &self.role)
            .field("state", &self.state())
            .field("sharing", &self.outbound.read().is_some())
            .field("receiving", &self.inbound.read().is_some())
            .finish()
    }
}
