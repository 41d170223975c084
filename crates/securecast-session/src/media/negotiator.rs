//! Attaching and detaching outbound media on open sessions
//!
//! Adding or removing a track changes the negotiated session. Once the
//! channel is open there may be no signaling path left (the manual strategy
//! has none), so the new descriptors travel in-band as
//! `session_description` control messages on the session's own channel.
//!
//! Only the side that made the handshake offer creates in-band offers, and
//! it keeps at most one unanswered. The answering side sends a
//! `renegotiation_request` instead, so two offers never cross. Requests that
//! arrive while an offer is unanswered are folded into a single follow-up
//! offer sent once the answer is applied.

use std::sync::{Arc, Weak};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::track::MediaTrack;
use crate::channels::{ControlMessage, DataChannelBus};
use crate::connection::{RemoteTrackInfo, SdpKind};
use crate::events::{EventHub, SessionEvent};
use crate::peer::{OutboundMedia, PeerRegistry, PeerSession, Renegotiation};
use crate::session::state::{HandshakeRole, SessionState};
use crate::{Error, Result};

/// Per-peer view of screen sharing in both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenShareAssociation {
    pub device_id: String,
    /// We send a track to this peer
    pub is_sharing: bool,
    /// This peer sends a track to us
    pub is_receiving: bool,
    pub track_id: Option<String>,
}

pub struct MediaNegotiator {
    registry: Arc<PeerRegistry>,
    bus: Arc<DataChannelBus>,
    events: EventHub,
}

impl MediaNegotiator {
    pub fn new(registry: Arc<PeerRegistry>, bus: Arc<DataChannelBus>, events: EventHub) -> Arc<Self> {
        let negotiator = Arc::new(Self {
            registry,
            bus,
            events,
        });
        negotiator.install();
        negotiator
    }

    /// Register the control message handlers this negotiator reacts to
    fn install(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.bus.on_message("session_description", move |peer_id, message| {
            let weak: Weak<Self> = weak.clone();
            async move {
                if let Some(negotiator) = weak.upgrade() {
                    negotiator.on_session_description(&peer_id, message).await;
                }
            }
        });

        let weak = Arc::downgrade(self);
        self.bus.on_message("renegotiation_request", move |peer_id, message| {
            let weak: Weak<Self> = weak.clone();
            async move {
                if let Some(negotiator) = weak.upgrade() {
                    negotiator.on_renegotiation_request(&peer_id, message).await;
                }
            }
        });

        let weak = Arc::downgrade(self);
        self.bus.on_message("screen_share_stopped", move |peer_id, _| {
            let weak: Weak<Self> = weak.clone();
            async move {
                if let Some(negotiator) = weak.upgrade() {
                    negotiator.on_remote_share_stopped(&peer_id).await;
                }
            }
        });

        self.bus.on_message("screen_share_started", |peer_id, message| async move {
            if let ControlMessage::ScreenShareStarted { stream_id, .. } = message {
                debug!("{} started sharing stream {}", peer_id, stream_id);
            }
        });
    }

    async fn open_session(&self, peer_id: &str) -> Result<Arc<PeerSession>> {
        let session = self
            .registry
            .get(peer_id)
            .await
            .ok_or_else(|| Error::NoSuchSession(peer_id.to_string()))?;

        let state = session.state();
        if state != SessionState::ChannelOpen {
            return Err(Error::NotOpen {
                peer_id: peer_id.to_string(),
                state,
            });
        }
        Ok(session)
    }

    /// Attach `track` as the outbound media of `peer_id`
    ///
    /// Any previously attached track is detached first.
    #[instrument(skip(self, track), fields(track_id = track.id()))]
    pub async fn attach(&self, peer_id: &str, track: Arc<dyn MediaTrack>) -> Result<()> {
        let session = self.open_session(peer_id).await?;

        if let Some(previous) = session.take_outbound() {
            debug!("Replacing track {} for {}", previous.track.id(), peer_id);
            self.release(&session, previous, Some(track.id())).await;
        }

        let link = session.link().clone();
        let sender_id = link.add_track(track.clone()).await?;

        if let Err(e) = self.renegotiate(&session, true).await {
            if let Err(remove_err) = link.remove_track(&sender_id).await {
                warn!("Failed to roll back track for {}: {}", peer_id, remove_err);
            }
            return Err(e);
        }

        if let Err(e) = session.set_outbound(OutboundMedia {
            track: track.clone(),
            sender_id: sender_id.clone(),
            attached_at: Instant::now(),
        }) {
            // Session left channel_open while renegotiating.
            let _ = link.remove_track(&sender_id).await;
            return Err(e);
        }

        if !self
            .bus
            .send(peer_id, &ControlMessage::screen_share_started(track.stream_id(), 1))
            .await
        {
            warn!("Could not announce screen share to {}", peer_id);
        }

        info!("Attached track {} to {}", track.id(), peer_id);
        Ok(())
    }

    /// Detach the outbound track of `peer_id`; idempotent
    #[instrument(skip(self))]
    pub async fn detach(&self, peer_id: &str) -> Result<()> {
        let Some(session) = self.registry.get(peer_id).await else {
            debug!("No session for {}; nothing to detach", peer_id);
            return Ok(());
        };
        let Some(outbound) = session.take_outbound() else {
            debug!("No outbound track for {}", peer_id);
            return Ok(());
        };

        let track_id = outbound.track.id().to_string();
        self.release(&session, outbound, None).await;

        if session.is_open() {
            if let Err(e) = self.renegotiate(&session, false).await {
                warn!("Renegotiation after detach from {} failed: {}", peer_id, e);
            }
            if !self
                .bus
                .send(peer_id, &ControlMessage::screen_share_stopped())
                .await
            {
                warn!("Could not announce end of screen share to {}", peer_id);
            }
        }

        info!("Detached track {} from {}", track_id, peer_id);
        Ok(())
    }

    /// Remove the sender and stop the track unless it is still in use
    ///
    /// `replacement` is the track about to be attached in its place.
    async fn release(&self, session: &PeerSession, outbound: OutboundMedia, replacement: Option<&str>) {
        if let Err(e) = session.link().remove_track(&outbound.sender_id).await {
            warn!(
                "Failed to remove track {} from {}: {}",
                outbound.track.id(),
                session.peer_id(),
                e
            );
        }

        let track_id = outbound.track.id();
        let shared = self.registry.list_all().await.iter().any(|other| {
            other
                .outbound()
                .is_some_and(|media| media.track.id() == track_id)
        });
        if shared || replacement == Some(track_id) {
            debug!("Track {} still in use; leaving it running", track_id);
        } else {
            outbound.track.stop();
        }
    }

    /// Bring the remote side up to date with this session's tracks
    ///
    /// `adds_track` tells the offering side to make room for a track we are
    /// about to send.
    async fn renegotiate(&self, session: &PeerSession, adds_track: bool) -> Result<()> {
        let peer_id = session.peer_id();
        if session.role() != HandshakeRole::Offerer {
            if !self
                .bus
                .send(&peer_id, &ControlMessage::renegotiation_request(adds_track))
                .await
            {
                return Err(Error::DataChannelError(format!(
                    "could not request renegotiation from {}",
                    peer_id
                )));
            }
            debug!("Asked {} for a renegotiation offer", peer_id);
            return Ok(());
        }

        let mut round = session.renegotiation().await;
        if round.offer_outstanding {
            round.pending = true;
            debug!("Offer to {} still unanswered; queued another round", peer_id);
            return Ok(());
        }
        self.send_offer(session, &mut round).await
    }

    /// Create an offer and send it over the session's channel
    async fn send_offer(&self, session: &PeerSession, round: &mut Renegotiation) -> Result<()> {
        round.pending = false;
        let peer_id = session.peer_id();
        let sdp = session.link().create_offer().await?;
        round.offer_outstanding = true;

        if !self
            .bus
            .send(&peer_id, &ControlMessage::session_description(SdpKind::Offer, sdp))
            .await
        {
            return Err(Error::DataChannelError(format!(
                "could not send renegotiation offer to {}",
                peer_id
            )));
        }
        debug!("Sent renegotiation offer to {}", peer_id);
        Ok(())
    }

    fn renegotiation_failed(&self, peer_id: &str, error: &Error) {
        warn!("Renegotiation with {} failed: {}", peer_id, error);
        self.events.publish(SessionEvent::Error {
            peer_id: Some(peer_id.to_string()),
            message: format!("renegotiation failed: {}", error),
        });
    }

    async fn on_renegotiation_request(&self, peer_id: &str, message: ControlMessage) {
        let ControlMessage::RenegotiationRequest { adds_track, .. } = message else {
            return;
        };
        let Some(session) = self.registry.get(peer_id).await else {
            warn!("Renegotiation request from {} without a session", peer_id);
            return;
        };
        if session.role() != HandshakeRole::Offerer {
            warn!("Ignoring renegotiation request from {}; it makes the offers", peer_id);
            return;
        }

        if adds_track {
            if let Err(e) = session.link().reserve_inbound_video().await {
                warn!("Could not make room for a track from {}: {}", peer_id, e);
            }
        }
        if let Err(e) = self.renegotiate(&session, false).await {
            self.renegotiation_failed(peer_id, &e);
        }
    }

    async fn on_session_description(&self, peer_id: &str, message: ControlMessage) {
        let ControlMessage::SessionDescription { kind, sdp, .. } = message else {
            return;
        };
        let Some(session) = self.registry.get(peer_id).await else {
            warn!("Descriptor from {} without a session", peer_id);
            return;
        };
        let link = session.link();
        let mut round = session.renegotiation().await;

        match kind {
            SdpKind::Answer => {
                if !round.offer_outstanding {
                    debug!("Dropping answer from {} with no offer in flight", peer_id);
                    return;
                }
                round.offer_outstanding = false;
                if let Err(e) = link.apply_remote_description(kind, &sdp).await {
                    self.renegotiation_failed(peer_id, &e);
                    return;
                }
                if round.pending {
                    if let Err(e) = self.send_offer(&session, &mut round).await {
                        self.renegotiation_failed(peer_id, &e);
                    }
                }
            }
            SdpKind::Offer => {
                if session.role() == HandshakeRole::Offerer {
                    warn!("Ignoring in-band offer from {}; offers flow the other way", peer_id);
                    return;
                }
                if let Err(e) = link.apply_remote_description(kind, &sdp).await {
                    self.renegotiation_failed(peer_id, &e);
                    return;
                }
                match link.create_answer().await {
                    Ok(answer) => {
                        if !self
                            .bus
                            .send(peer_id, &ControlMessage::session_description(SdpKind::Answer, answer))
                            .await
                        {
                            warn!("Could not send renegotiation answer to {}", peer_id);
                        }
                    }
                    Err(e) => self.renegotiation_failed(peer_id, &e),
                }
            }
        }
    }

    async fn on_remote_share_stopped(&self, peer_id: &str) {
        let Some(session) = self.registry.get(peer_id).await else {
            return;
        };
        if let Some(track) = session.inbound() {
            session.set_inbound(None);
            self.events.publish(SessionEvent::RemoteTrackEnded {
                peer_id: peer_id.to_string(),
                track_id: track.track_id,
            });
        }
    }

    /// A remote track arrived on `peer_id`'s connection
    pub(crate) async fn on_remote_track(&self, peer_id: &str, track: RemoteTrackInfo) {
        let Some(session) = self.registry.get(peer_id).await else {
            return;
        };
        info!("Receiving track {} from {}", track.track_id, peer_id);
        session.set_inbound(Some(track.clone()));
        self.events.publish(SessionEvent::RemoteTrack {
            peer_id: peer_id.to_string(),
            track,
        });
    }

    pub(crate) async fn on_remote_track_ended(&self, peer_id: &str, track_id: &str) {
        let Some(session) = self.registry.get(peer_id).await else {
            return;
        };
        if session
            .inbound()
            .is_some_and(|track| track.track_id == track_id)
        {
            session.set_inbound(None);
            self.events.publish(SessionEvent::RemoteTrackEnded {
                peer_id: peer_id.to_string(),
                track_id: track_id.to_string(),
            });
        }
    }

    /// Sharing state with `peer_id`; `None` when nothing flows either way
    pub async fn association(&self, peer_id: &str) -> Option<ScreenShareAssociation> {
        let session = self.registry.get(peer_id).await?;
        Self::associate(peer_id, &session)
    }

    pub async fn associations(&self) -> Vec<ScreenShareAssociation> {
        let mut associations: Vec<_> = self
            .registry
            .list_all()
            .await
            .iter()
            .filter_map(|session| Self::associate(&session.peer_id(), session))
            .collect();
        associations.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        associations
    }

    fn associate(peer_id: &str, session: &PeerSession) -> Option<ScreenShareAssociation> {
        let outbound = session.outbound();
        let inbound = session.inbound();
        if outbound.is_none() && inbound.is_none() {
            return None;
        }

        let track_id = outbound
            .as_ref()
            .map(|media| media.track.id().to_string())
            .or_else(|| inbound.as_ref().map(|track| track.track_id.clone()));

        Some(ScreenShareAssociation {
            device_id: peer_id.to_string(),
            is_sharing: outbound.is_some(),
            is_receiving: inbound.is_some(),
            track_id,
        })
    }

    /// Peers currently receiving one of our tracks
    pub async fn active_outbound(&self) -> Vec<Arc<PeerSession>> {
        self.registry
            .list_open()
            .await
            .into_iter()
            .filter(|session| session.outbound().is_some())
            .collect()
    }
}
