//! Session state machine
//!
//! Drives a handshake from a locally created descriptor and a remotely
//! supplied envelope to an open data channel, for both sides of the
//! exchange. Envelopes leave through the injected [`SignalingTransport`];
//! connections come from the injected [`ConnectionFactory`].
//!
//! Every registered session gets a pump task that follows its link events
//! (channel open, inbound messages, remote tracks, late candidates, link
//! loss) and publishes state changes as [`SessionEvent`]s.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::state::{HandshakeRole, SessionState};
use crate::channels::{ControlMessage, DataChannelBus};
use crate::config::SessionConfig;
use crate::connection::{ConnectionFactory, LinkEvent, LinkState, SdpKind};
use crate::events::{EventHub, SessionEvent};
use crate::identity::{DeviceIdentity, DeviceInfo};
use crate::media::{MediaNegotiator, MediaTrack};
use crate::peer::{Gathering, PeerRegistry, PeerSession};
use crate::signaling::{
    CandidateRecord, EnvelopeKind, ManualTransport, SignalingEnvelope, SignalingTransport,
};
use crate::{Error, Result};

/// Remote candidates held per peer until its description is applied
const MAX_BUFFERED_CANDIDATES: usize = 64;

/// Snapshot for diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub device: DeviceInfo,
    pub transport: String,
    pub session_count: usize,
    pub sessions_by_state: BTreeMap<String, usize>,
}

/// Peer session lifecycle manager
///
/// Cloning is cheap; clones share the same sessions.
#[derive(Clone)]
pub struct SessionMachine {
    inner: Arc<MachineInner>,
}

struct MachineInner {
    config: SessionConfig,
    identity: DeviceIdentity,
    factory: Arc<dyn ConnectionFactory>,
    transport: Arc<dyn SignalingTransport>,
    registry: Arc<PeerRegistry>,
    bus: Arc<DataChannelBus>,
    negotiator: Arc<MediaNegotiator>,
    events: EventHub,
    pending_candidates: Mutex<HashMap<String, Vec<CandidateRecord>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl SessionMachine {
    /// Create a machine with a freshly generated device identity
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn ConnectionFactory>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Result<Self> {
        let identity = DeviceIdentity::generate(config.device_name.as_deref());
        Self::with_identity(config, identity, factory, transport)
    }

    /// Create a machine for the copy/paste strategy
    pub fn manual(config: SessionConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        Self::new(config, factory, Arc::new(ManualTransport))
    }

    /// # Errors
    ///
    /// `InvalidConfig` for a bad configuration, `ConnectionSetupError` when
    /// the factory cannot build connections on this device.
    pub fn with_identity(
        config: SessionConfig,
        identity: DeviceIdentity,
        factory: Arc<dyn ConnectionFactory>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Result<Self> {
        config.validate()?;
        factory.check_available().map_err(setup_error)?;

        let registry = Arc::new(PeerRegistry::new(config.max_sessions)?);
        let events = EventHub::new(config.event_capacity);
        let bus = Arc::new(DataChannelBus::new(registry.clone(), config.event_capacity));
        let negotiator = MediaNegotiator::new(registry.clone(), bus.clone(), events.clone());

        info!(
            "Session machine ready for {} ({}) using {} signaling",
            identity.device_name,
            identity.device_id,
            transport.name()
        );

        Ok(Self {
            inner: Arc::new(MachineInner {
                config,
                identity,
                factory,
                transport,
                registry,
                bus,
                negotiator,
                events,
                pending_candidates: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.inner.registry
    }

    pub fn bus(&self) -> &Arc<DataChannelBus> {
        &self.inner.bus
    }

    pub fn negotiator(&self) -> &Arc<MediaNegotiator> {
        &self.inner.negotiator
    }

    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Create an offer and return its envelope text
    ///
    /// The pending session is keyed by this device's id until the answer
    /// names the remote device, so only one manual offer can be pending.
    #[instrument(skip(self), fields(device_id = %self.inner.identity.device_id))]
    pub async fn create_offer(&self) -> Result<String> {
        self.offer_to(None).await?.encode()
    }

    /// Create an offer addressed to `recipient`, or a manual one when `None`
    pub async fn offer_to(&self, recipient: Option<&str>) -> Result<SignalingEnvelope> {
        let inner = &self.inner;
        inner.ensure_running()?;

        let key = recipient.unwrap_or(&inner.identity.device_id).to_string();
        if inner.registry.contains(&key).await {
            return Err(Error::AlreadyExists(key));
        }

        let session = inner.open_session(&key, HandshakeRole::Offerer).await?;
        match inner.prepare_offer(&session, recipient).await {
            Ok(envelope) => Ok(envelope),
            Err(e) => {
                inner.fail(&session, &e).await;
                Err(e)
            }
        }
    }

    /// Apply the answer to a pending offer and wait for the channel
    ///
    /// Returns the id of the remote device.
    ///
    /// # Errors
    ///
    /// `InvalidAnswer` when the text does not decode, is not an answer, or
    /// no offer is pending; `HandshakeTimeout` when the channel does not
    /// open in time, in which case the session is failed and released.
    #[instrument(skip(self, text))]
    pub async fn complete_with_answer(&self, text: &str) -> Result<String> {
        let envelope = SignalingEnvelope::decode(text).map_err(|e| match e {
            Error::MalformedEnvelope(reason) => Error::InvalidAnswer(reason),
            other => Error::InvalidAnswer(other.to_string()),
        })?;
        self.complete_answer(envelope).await
    }

    pub async fn complete_answer(&self, envelope: SignalingEnvelope) -> Result<String> {
        let inner = &self.inner;
        inner.ensure_running()?;

        if envelope.kind != EnvelopeKind::Answer {
            return Err(Error::InvalidAnswer(format!(
                "expected an answer envelope, got {}",
                envelope.kind
            )));
        }

        let session = inner.pending_offer(&envelope.device_id).await.ok_or_else(|| {
            Error::InvalidAnswer(format!("no pending offer for {}", envelope.device_id))
        })?;

        let peer_id = envelope.device_id.clone();
        let link = session.link().clone();
        link.apply_remote_description(SdpKind::Answer, &envelope.sdp)
            .await
            .map_err(|e| Error::InvalidAnswer(format!("could not apply answer: {}", e)))?;

        inner.apply_candidates(&session, &envelope.ice_candidates).await;
        inner.flush_pending(&session, &peer_id).await;
        session.set_remote_name(&envelope.device_name);

        let provisional = session.peer_id();
        if let Err(e) = inner.registry.rekey(&provisional, &peer_id).await {
            inner.fail(&session, &e).await;
            return Err(e);
        }

        if let Err(e) = session.transition(SessionState::AnswerCreated) {
            inner.fail(&session, &e).await;
            return Err(e);
        }
        session.mark_exchanged();
        inner.promote(&session);

        inner.wait_open(&session).await?;
        info!("Handshake with {} complete", peer_id);
        Ok(peer_id)
    }

    /// Accept an offer and return the answer envelope text
    ///
    /// # Errors
    ///
    /// `MalformedEnvelope` when the text does not decode (no session is
    /// created), `InvalidOffer` when it is not an offer or cannot be applied,
    /// `AlreadyExists` when a session with the sender exists.
    #[instrument(skip(self, text))]
    pub async fn accept_offer(&self, text: &str) -> Result<String> {
        let envelope = SignalingEnvelope::decode(text)?;
        self.accept(envelope).await?.encode()
    }

    pub async fn accept(&self, offer: SignalingEnvelope) -> Result<SignalingEnvelope> {
        let inner = &self.inner;
        inner.ensure_running()?;

        if offer.kind != EnvelopeKind::Offer {
            return Err(Error::InvalidOffer(format!(
                "expected an offer envelope, got {}",
                offer.kind
            )));
        }
        if offer.device_id == inner.identity.device_id {
            return Err(Error::InvalidOffer(
                "the offer was created on this device".to_string(),
            ));
        }
        if inner.registry.contains(&offer.device_id).await {
            return Err(Error::AlreadyExists(offer.device_id.clone()));
        }

        let session = inner
            .open_session(&offer.device_id, HandshakeRole::Answerer)
            .await?;
        session.set_remote_name(&offer.device_name);

        match inner.prepare_answer(&session, &offer).await {
            Ok(answer) => {
                self.spawn_watchdog(session);
                Ok(answer)
            }
            Err(e) => {
                inner.fail(&session, &e).await;
                Err(e)
            }
        }
    }

    /// Wait until the session with `peer_id` opens, bounded by the handshake window
    pub async fn wait_open(&self, peer_id: &str) -> Result<()> {
        let session = self
            .inner
            .registry
            .get(peer_id)
            .await
            .ok_or_else(|| Error::NoSuchSession(peer_id.to_string()))?;
        self.inner.wait_open(&session).await
    }

    /// Apply a candidate trickled by `from`
    ///
    /// Held back until the remote description of that peer is applied.
    pub async fn add_remote_candidate(&self, from: &str, candidate: CandidateRecord) {
        let session = self.inner.registry.get(from).await;
        {
            let mut pending = self.inner.pending_candidates.lock();
            if !session.as_ref().is_some_and(|s| s.remote_applied()) {
                let buffered = pending.entry(from.to_string()).or_default();
                if buffered.len() >= MAX_BUFFERED_CANDIDATES {
                    warn!("Too many early candidates from {}; dropping one", from);
                } else {
                    trace!("Holding early candidate from {}", from);
                    buffered.push(candidate);
                }
                return;
            }
        }

        if let Some(session) = session {
            if let Err(e) = session.link().add_candidate(&candidate).await {
                warn!("Failed to add candidate from {}: {}", from, e);
            }
        }
    }

    /// Close the session with `peer_id`; false when there was none
    #[instrument(skip(self))]
    pub async fn disconnect(&self, peer_id: &str) -> bool {
        self.end_session(peer_id, "disconnected locally").await
    }

    /// Close the session with a peer that announced it is leaving
    pub(crate) async fn peer_left(&self, peer_id: &str) -> bool {
        self.end_session(peer_id, "peer left").await
    }

    async fn end_session(&self, peer_id: &str, reason: &str) -> bool {
        let inner = &self.inner;
        let Some(session) = inner.registry.get(peer_id).await else {
            return false;
        };

        if session.outbound().is_some() {
            if let Err(e) = inner.negotiator.detach(peer_id).await {
                warn!("Failed to detach track from {}: {}", peer_id, e);
            }
        }

        let announce = session.claim_disconnect();
        inner.registry.remove_if_same(peer_id, &session).await;
        inner.pending_candidates.lock().remove(peer_id);

        if announce {
            info!("Disconnected from {}: {}", peer_id, reason);
            inner.events.publish(SessionEvent::Disconnected {
                peer_id: peer_id.to_string(),
                reason: Some(reason.to_string()),
            });
        }
        true
    }

    /// Send a control message; false unless the channel is open
    pub async fn send(&self, peer_id: &str, message: &ControlMessage) -> bool {
        self.inner.bus.send(peer_id, message).await
    }

    pub fn on_message<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(String, ControlMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.bus.on_message(kind, handler);
    }

    pub async fn attach(&self, peer_id: &str, track: Arc<dyn MediaTrack>) -> Result<()> {
        self.inner.negotiator.attach(peer_id, track).await
    }

    pub async fn detach(&self, peer_id: &str) -> Result<()> {
        self.inner.negotiator.detach(peer_id).await
    }

    pub async fn list_open(&self) -> Vec<Arc<PeerSession>> {
        self.inner.registry.list_open().await
    }

    pub fn local_device(&self) -> DeviceInfo {
        self.inner.identity.info()
    }

    pub async fn debug_info(&self) -> DebugInfo {
        let sessions = self.inner.registry.list_all().await;
        let mut sessions_by_state = BTreeMap::new();
        for session in &sessions {
            *sessions_by_state
                .entry(session.state().as_str().to_string())
                .or_insert(0) += 1;
        }

        DebugInfo {
            device: self.local_device(),
            transport: self.inner.transport.name().to_string(),
            session_count: sessions.len(),
            sessions_by_state,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Close every session and stop background work; idempotent
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down session machine");
        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        inner.registry.close_all().await;
        inner.pending_candidates.lock().clear();
        inner.transport.shutdown().await;
    }

    /// Fail the answering session if its channel never opens
    fn spawn_watchdog(&self, session: Arc<PeerSession>) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let peer_id = session.peer_id();
            if let Err(e) = inner.wait_open(&session).await {
                inner.events.publish(SessionEvent::Error {
                    peer_id: Some(peer_id),
                    message: e.to_string(),
                });
            }
        });
        self.inner.track_task(handle);
    }
}

impl MachineInner {
    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::ConnectionSetupError(
                "session machine has been shut down".to_string(),
            ));
        }
        Ok(())
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Build a link, register a session for it and start its pump
    async fn open_session(
        self: &Arc<Self>,
        key: &str,
        role: HandshakeRole,
    ) -> Result<Arc<PeerSession>> {
        let link = self.factory.create().await.map_err(setup_error)?;
        let session = Arc::new(PeerSession::new(key, role, link.clone()));

        if let Err(e) = self.registry.register(key, session.clone()).await {
            if let Err(close_err) = link.close().await {
                warn!("Failed to close unused connection: {}", close_err);
            }
            return Err(e);
        }

        let events = link.subscribe();
        let states = session.subscribe_state();
        let pump = tokio::spawn(run_pump(
            Arc::downgrade(self),
            session.clone(),
            events,
            states,
        ));
        self.track_task(pump);

        Ok(session)
    }

    async fn prepare_offer(
        &self,
        session: &Arc<PeerSession>,
        recipient: Option<&str>,
    ) -> Result<SignalingEnvelope> {
        let link = session.link();
        let gathering = Gathering::attach(link.as_ref());

        link.open_channel(&self.config.channel_label).await?;
        let sdp = link.create_offer().await?;
        let candidates = gathering.finish(self.config.gather_timeout()).await;

        session.transition(SessionState::OfferCreated)?;
        let envelope = SignalingEnvelope::new(EnvelopeKind::Offer, &self.identity, sdp, candidates);

        session.mark_exchanged();
        self.transport.publish(&envelope, recipient).await?;
        info!(
            "Created offer with {} candidates{}",
            envelope.ice_candidates.len(),
            recipient.map(|r| format!(" for {}", r)).unwrap_or_default()
        );
        Ok(envelope)
    }

    async fn prepare_answer(
        &self,
        session: &Arc<PeerSession>,
        offer: &SignalingEnvelope,
    ) -> Result<SignalingEnvelope> {
        let link = session.link();
        let gathering = Gathering::attach(link.as_ref());

        link.apply_remote_description(SdpKind::Offer, &offer.sdp)
            .await
            .map_err(|e| Error::InvalidOffer(format!("could not apply offer: {}", e)))?;
        self.apply_candidates(session, &offer.ice_candidates).await;
        self.flush_pending(session, &offer.device_id).await;

        let sdp = link.create_answer().await?;
        let candidates = gathering.finish(self.config.gather_timeout()).await;

        session.transition(SessionState::AnswerCreated)?;
        let answer = SignalingEnvelope::new(EnvelopeKind::Answer, &self.identity, sdp, candidates);

        session.mark_exchanged();
        self.promote(session);
        self.transport.publish(&answer, Some(&offer.device_id)).await?;
        info!(
            "Answered offer from {} with {} candidates",
            offer.device_id,
            answer.ice_candidates.len()
        );
        Ok(answer)
    }

    async fn apply_candidates(&self, session: &PeerSession, candidates: &[CandidateRecord]) {
        for candidate in candidates {
            if let Err(e) = session.link().add_candidate(candidate).await {
                warn!("Failed to add candidate {}: {}", candidate.candidate, e);
            }
        }
    }

    /// Mark the remote description applied and add candidates held for `remote_id`
    async fn flush_pending(&self, session: &PeerSession, remote_id: &str) {
        let buffered = {
            let mut pending = self.pending_candidates.lock();
            session.mark_remote_applied();
            pending.remove(remote_id).unwrap_or_default()
        };
        if !buffered.is_empty() {
            debug!("Applying {} early candidates from {}", buffered.len(), remote_id);
            self.apply_candidates(session, &buffered).await;
        }
    }

    async fn pending_offer(&self, remote_id: &str) -> Option<Arc<PeerSession>> {
        for key in [remote_id, self.identity.device_id.as_str()] {
            if let Some(session) = self.registry.get(key).await {
                if session.role() == HandshakeRole::Offerer
                    && session.state() == SessionState::OfferCreated
                {
                    return Some(session);
                }
            }
        }
        None
    }

    /// Move to `channel_open` if the channel is there; announces the connection once
    fn promote(&self, session: &PeerSession) {
        if session.promote_if_ready() {
            let peer_id = session.peer_id();
            info!("Channel to {} is open", session.display_name());
            self.events.publish(SessionEvent::Connected {
                peer_id,
                device_name: session.remote_name(),
            });
        }
    }

    async fn wait_open(&self, session: &Arc<PeerSession>) -> Result<()> {
        let timeout = self.config.handshake_timeout();
        let mut states = session.subscribe_state();
        let outcome = tokio::time::timeout(timeout, async {
            states
                .wait_for(|state| *state == SessionState::ChannelOpen || state.is_terminal())
                .await
                .map(|state| *state)
        })
        .await;

        let peer_id = session.peer_id();
        match outcome {
            Ok(Ok(SessionState::ChannelOpen)) => Ok(()),
            Ok(Ok(state)) => Err(Error::ConnectionSetupError(format!(
                "session with {} ended in state {}",
                peer_id, state
            ))),
            Ok(Err(_)) => Err(Error::ConnectionSetupError(format!(
                "session with {} was dropped",
                peer_id
            ))),
            Err(_) => {
                let err = Error::HandshakeTimeout {
                    peer_id,
                    waited_ms: timeout.as_millis() as u64,
                };
                self.fail(session, &err).await;
                Err(err)
            }
        }
    }

    /// Fail a session and release it
    async fn fail(&self, session: &Arc<PeerSession>, reason: &Error) {
        let peer_id = session.peer_id();
        warn!("Session with {} failed: {}", peer_id, reason);

        if let Err(e) = session.transition(SessionState::Failed) {
            debug!("Session with {} already ended: {}", peer_id, e);
        }
        if self.registry.remove_if_same(&peer_id, session).await {
            self.pending_candidates.lock().remove(&peer_id);
        }
    }

    /// React to one link event; `Some(reason)` ends the session
    async fn on_link_event(&self, session: &Arc<PeerSession>, event: LinkEvent) -> Option<&'static str> {
        let peer_id = session.peer_id();

        match event {
            LinkEvent::Candidate(candidate) => {
                if !session.exchanged() {
                    // Still inside the gathering window.
                } else if self.transport.supports_trickle() {
                    if let Err(e) = self.transport.trickle(&peer_id, &candidate).await {
                        warn!("Failed to trickle candidate to {}: {}", peer_id, e);
                    }
                } else {
                    debug!("Discarding late candidate for {}", peer_id);
                }
            }
            LinkEvent::GatheringComplete => trace!("Gathering complete for {}", peer_id),
            LinkEvent::StateChanged(LinkState::Failed) => {
                if let Err(e) = session.transition(SessionState::Failed) {
                    debug!("Session with {} already ended: {}", peer_id, e);
                }
                return Some("connection failed");
            }
            LinkEvent::StateChanged(LinkState::Closed) => return Some("connection closed"),
            LinkEvent::StateChanged(state) => debug!("Connection to {} is {:?}", peer_id, state),
            LinkEvent::ChannelOpen(channel) => {
                debug!("Channel {} to {} opened", channel.label(), peer_id);
                session.set_channel(channel);
                self.promote(session);
            }
            LinkEvent::ChannelMessage(text) => self.bus.dispatch(&peer_id, &text).await,
            LinkEvent::ChannelClosed => return Some("channel closed"),
            LinkEvent::RemoteTrack(track) => self.negotiator.on_remote_track(&peer_id, track).await,
            LinkEvent::RemoteTrackEnded { track_id } => {
                self.negotiator
                    .on_remote_track_ended(&peer_id, &track_id)
                    .await
            }
        }
        None
    }

    /// Release a session whose link went away
    async fn link_down(&self, session: &Arc<PeerSession>, reason: &str, opened: bool) {
        let peer_id = session.peer_id();
        let removed = self.registry.remove_if_same(&peer_id, session).await;
        if removed {
            self.pending_candidates.lock().remove(&peer_id);
        }

        if (removed || opened) && session.claim_disconnect() {
            info!("Session with {} ended: {}", peer_id, reason);
            self.events.publish(SessionEvent::Disconnected {
                peer_id,
                reason: Some(reason.to_string()),
            });
        }
    }

    fn publish_state(&self, session: &PeerSession, from: SessionState, to: SessionState) {
        if from != to {
            self.events.publish(SessionEvent::StateChanged {
                peer_id: session.peer_id(),
                from,
                to,
            });
        }
    }
}

/// Follow one session's link and state until it ends
///
/// Intermediate states may be coalesced in the published transitions.
async fn run_pump(
    machine: Weak<MachineInner>,
    session: Arc<PeerSession>,
    mut events: broadcast::Receiver<LinkEvent>,
    mut states: watch::Receiver<SessionState>,
) {
    let mut last = *states.borrow_and_update();
    let mut opened = false;

    let reason = loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break None;
                }
                let to = *states.borrow_and_update();
                let Some(inner) = machine.upgrade() else {
                    break None;
                };
                inner.publish_state(&session, last, to);
                last = to;
                if to == SessionState::Closed {
                    break Some("session closed");
                }
            }
            event = events.recv() => {
                let Some(inner) = machine.upgrade() else {
                    break None;
                };
                match event {
                    Ok(event) => {
                        if matches!(event, LinkEvent::ChannelOpen(_)) {
                            opened = true;
                        }
                        if let Some(reason) = inner.on_link_event(&session, event).await {
                            break Some(reason);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Link events for {} lagged, {} skipped", session.peer_id(), skipped);
                    }
                    Err(RecvError::Closed) => break Some("connection dropped"),
                }
            }
        }
    };

    let Some(inner) = machine.upgrade() else {
        return;
    };
    if let Some(reason) = reason {
        inner.link_down(&session, reason, opened).await;
    }
    inner.publish_state(&session, last, session.state());
    trace!("Pump for {} stopped", session.peer_id());
}

fn setup_error(err: Error) -> Error {
    match err {
        Error::ConnectionSetupError(_) => err,
        other => Error::ConnectionSetupError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{MemoryNetwork, MemoryOptions};
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig {
            gather_timeout_ms: 200,
            handshake_timeout_ms: 2000,
            ..SessionConfig::default()
        }
    }

    fn machine(network: &MemoryNetwork, id: &str) -> SessionMachine {
        SessionMachine::with_identity(
            config(),
            DeviceIdentity::with_id(id, None),
            Arc::new(network.clone()),
            Arc::new(ManualTransport),
        )
        .unwrap()
    }

    #[test]
    fn test_unavailable_primitive_fails_construction() {
        let err = SessionMachine::manual(config(), Arc::new(MemoryNetwork::unavailable()))
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConnectionSetupError(_)));
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let config = SessionConfig {
            max_sessions: 0,
            ..SessionConfig::default()
        };
        let err = SessionMachine::manual(config, Arc::new(MemoryNetwork::new()))
            .err()
            .unwrap();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_offer_registers_provisional_session() {
        let network = MemoryNetwork::new();
        let a = machine(&network, "A1");

        let text = a.create_offer().await.unwrap();
        let envelope = SignalingEnvelope::decode(&text).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Offer);
        assert_eq!(envelope.device_id, "A1");
        assert_eq!(envelope.ice_candidates.len(), 2);

        let session = a.registry().get("A1").await.unwrap();
        assert_eq!(session.state(), SessionState::OfferCreated);
        assert_eq!(session.role(), HandshakeRole::Offerer);
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_invalid() {
        let network = MemoryNetwork::new();
        let a = machine(&network, "A1");
        let b = machine(&network, "B1");
        let c = machine(&network, "C1");

        let offer = c.create_offer().await.unwrap();
        let answer = b.accept_offer(&offer).await.unwrap();

        let err = a.complete_with_answer(&answer).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAnswer(_)));
        let err = a.complete_with_answer("{}").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAnswer(_)));
    }

    #[tokio::test]
    async fn test_offer_given_to_complete_is_invalid_answer() {
        let network = MemoryNetwork::new();
        let a = machine(&network, "A1");
        let b = machine(&network, "B1");

        a.create_offer().await.unwrap();
        let other_offer = b.create_offer().await.unwrap();
        let err = a.complete_with_answer(&other_offer).await.unwrap_err();
        assert!(matches!(err, Error::InvalidAnswer(_)));
        assert_eq!(
            a.registry().get("A1").await.unwrap().state(),
            SessionState::OfferCreated
        );
    }

    #[tokio::test]
    async fn test_answer_given_to_accept_is_invalid_offer() {
        let network = MemoryNetwork::new();
        let a = machine(&network, "A1");
        let b = machine(&network, "B1");
        let c = machine(&network, "C1");

        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(&offer).await.unwrap();
        let err = c.accept_offer(&answer).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOffer(_)));
        assert!(c.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_own_offer_rejected() {
        let network = MemoryNetwork::new();
        let a = machine(&network, "A1");
        let offer = a.create_offer().await.unwrap();
        assert!(matches!(
            a.accept_offer(&offer).await.unwrap_err(),
            Error::InvalidOffer(_)
        ));
    }

    #[tokio::test]
    async fn test_handshake_publishes_events() {
        let network = MemoryNetwork::new();
        let a = machine(&network, "A1");
        let b = machine(&network, "B1");
        let mut a_events = a.subscribe();

        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(&offer).await.unwrap();
        assert_eq!(a.complete_with_answer(&answer).await.unwrap(), "B1");

        let connected = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let SessionEvent::Connected { peer_id, .. } = a_events.recv().await.unwrap() {
                    return peer_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(connected, "B1");

        let info = a.debug_info().await;
        assert_eq!(info.session_count, 1);
        assert_eq!(info.sessions_by_state.get("channel_open"), Some(&1));
        assert_eq!(info.transport, "manual");
    }

    #[tokio::test]
    async fn test_early_candidates_are_held_until_applied() {
        let network = MemoryNetwork::new();
        let a = machine(&network, "A1");
        let b = machine(&network, "B1");

        let early = CandidateRecord::new("candidate:9 1 udp 1 10.0.0.9 9 typ host", 0, "0");
        b.add_remote_candidate("A1", early.clone()).await;

        let offer = a.create_offer().await.unwrap();
        b.accept_offer(&offer).await.unwrap();

        let session = b.registry().get("A1").await.unwrap();
        let link = network.link(session.link().link_id()).unwrap();
        assert!(link.remote_candidates().contains(&early));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let network = MemoryNetwork::with_options(MemoryOptions::default());
        let a = machine(&network, "A1");
        a.create_offer().await.unwrap();

        a.shutdown().await;
        assert!(a.registry().is_empty().await);
        assert!(a.is_shut_down());
        assert!(matches!(
            a.create_offer().await.unwrap_err(),
            Error::ConnectionSetupError(_)
        ));
        a.shutdown().await;
    }
}
