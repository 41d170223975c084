//! In-process connection primitive
//!
//! Links created from the same [`MemoryNetwork`] find each other through the
//! descriptors they exchange: a descriptor names the link that produced it,
//! and applying an answer pairs the two links, connects them and opens the
//! negotiated channel on both sides. Candidate discovery is simulated with a
//! configurable count, spacing and completion behaviour.
//!
//! Offer/answer follows the same signaling states as a real peer connection.
//! An answer is only accepted while a local offer is outstanding, and a
//! remote offer only while none is. Outbound tracks are listed in each
//! descriptor and reach the remote side when it applies one.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::{
    ConnectionFactory, DataLink, LinkEvent, LinkState, PeerLink, RemoteTrackInfo, SdpKind,
    LINK_EVENT_CAPACITY,
};
use crate::media::MediaTrack;
use crate::signaling::CandidateRecord;
use crate::{Error, Result};

const LINK_MARKER: &str = "a=memory-link:";
const TRACK_MARKER: &str = "a=track:";

/// How simulated candidate gathering ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringMode {
    /// Emit every candidate, then signal completion
    Complete,
    /// Emit candidates but never signal completion (forces the gather timeout)
    Never,
}

/// Behaviour of links created by a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Candidates emitted per link
    pub candidates: usize,
    /// Delay before each candidate
    pub candidate_interval: Duration,
    pub gathering: GatheringMode,
    /// Never open the data channel after pairing
    pub stall_channel: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            candidates: 2,
            candidate_interval: Duration::from_millis(5),
            gathering: GatheringMode::Complete,
            stall_channel: false,
        }
    }
}

struct NetworkInner {
    options: MemoryOptions,
    available: bool,
    next_id: AtomicU64,
    links: Mutex<HashMap<String, Weak<MemoryLink>>>,
}

/// Factory of in-process links that can reach each other
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_options(MemoryOptions::default())
    }

    pub fn with_options(options: MemoryOptions) -> Self {
        Self::build(options, true)
    }

    /// A network that reports peer connections as unavailable, standing in for a device without peer connections
    pub fn unavailable() -> Self {
        Self::build(MemoryOptions::default(), false)
    }

    fn build(options: MemoryOptions, available: bool) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                options,
                available,
                next_id: AtomicU64::new(1),
                links: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Links created by this network that are still alive
    pub fn links(&self) -> Vec<Arc<MemoryLink>> {
        self.inner
            .links
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn link(&self, link_id: &str) -> Option<Arc<MemoryLink>> {
        self.inner.links.lock().get(link_id).and_then(Weak::upgrade)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionFactory for MemoryNetwork {
    fn check_available(&self) -> Result<()> {
        if self.inner.available {
            Ok(())
        } else {
            Err(Error::ConnectionSetupError(
                "in-memory network is disabled".to_string(),
            ))
        }
    }

    async fn create(&self) -> Result<Arc<dyn PeerLink>> {
        self.check_available()?;

        let id = format!("mem-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (events, _) = broadcast::channel(LINK_EVENT_CAPACITY);
        let network = Arc::downgrade(&self.inner);
        let options = self.inner.options.clone();

        let link = Arc::new(MemoryLink {
            id: id.clone(),
            network,
            options,
            events,
            closed: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(LinkInner::default()),
        });

        let mut links = self.inner.links.lock();
        links.retain(|_, weak| weak.strong_count() > 0);
        links.insert(id.clone(), Arc::downgrade(&link));
        debug!("Created memory link {}", id);

        Ok(link)
    }
}

/// Offer/answer state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
        })
    }
}

fn kind_name(kind: SdpKind) -> &'static str {
    match kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
    }
}

#[derive(Default)]
struct LinkInner {
    state: Option<LinkState>,
    signaling: SignalingState,
    revision: u32,
    remote: Option<Weak<MemoryLink>>,
    channel_label: Option<String>,
    channel: Option<Arc<MemoryChannel>>,
    gathering_started: bool,
    next_sender: u32,
    senders: BTreeMap<String, RemoteTrackInfo>,
    remote_tracks: BTreeMap<String, RemoteTrackInfo>,
    receive_slots: usize,
    remote_candidates: Vec<CandidateRecord>,
}

impl LinkInner {
    fn state(&self) -> LinkState {
        self.state.unwrap_or(LinkState::New)
    }
}

/// One in-process peer link
pub struct MemoryLink {
    id: String,
    network: Weak<NetworkInner>,
    options: MemoryOptions,
    events: broadcast::Sender<LinkEvent>,
    closed: Arc<AtomicBool>,
    state: Mutex<LinkInner>,
}

impl MemoryLink {
    pub fn state(&self) -> LinkState {
        self.state.lock().state()
    }

    /// Candidates applied through [`PeerLink::add_candidate`]
    pub fn remote_candidates(&self) -> Vec<CandidateRecord> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    /// Number of outbound tracks currently added
    pub fn sender_count(&self) -> usize {
        self.state.lock().senders.len()
    }

    /// Receive slots added through [`PeerLink::reserve_inbound_video`]
    pub fn receive_slots(&self) -> usize {
        self.state.lock().receive_slots
    }

    /// Drop connectivity the way an ICE failure would
    pub fn fail(&self) {
        {
            let mut inner = self.state.lock();
            if inner.state() == LinkState::Closed {
                return;
            }
            inner.state = Some(LinkState::Failed);
        }
        self.emit(LinkEvent::StateChanged(LinkState::Failed));
    }

    fn emit(&self, event: LinkEvent) {
        trace!("memory link {} emits {:?}", self.id, event);
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::WebRtcError(format!("link {} is closed", self.id)));
        }
        Ok(())
    }

    fn descriptor(&self, kind: SdpKind, inner: &LinkInner) -> String {
        let mut sdp = format!(
            "v=0\r\ns=securecast-memory\r\n{}{}\r\na=type:{}\r\na=revision:{}\r\n",
            LINK_MARKER,
            self.id,
            kind_name(kind),
            inner.revision
        );
        for track in inner.senders.values() {
            sdp.push_str(&format!(
                "{}{} {} {}\r\n",
                TRACK_MARKER, track.track_id, track.stream_id, track.kind
            ));
        }
        sdp
    }

    fn start_gathering(&self) {
        {
            let mut inner = self.state.lock();
            if inner.gathering_started {
                return;
            }
            inner.gathering_started = true;
        }

        let events = self.events.clone();
        let closed = self.closed.clone();
        let options = self.options.clone();
        let link_id = self.id.clone();

        tokio::spawn(async move {
            for index in 0..options.candidates {
                tokio::time::sleep(options.candidate_interval).await;
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                let candidate = CandidateRecord::new(
                    format!(
                        "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host generation 0",
                        index + 1,
                        50_000 + index
                    ),
                    0,
                    "0",
                );
                let _ = events.send(LinkEvent::Candidate(candidate));
            }
            if options.gathering == GatheringMode::Complete {
                debug!("memory link {} finished gathering", link_id);
                let _ = events.send(LinkEvent::GatheringComplete);
            }
        });
    }

    fn pair_with(&self, remote: &Arc<MemoryLink>) {
        let label = {
            let mut inner = self.state.lock();
            inner.state = Some(LinkState::Connected);
            inner.channel_label.clone()
        };
        remote.state.lock().state = Some(LinkState::Connected);

        self.emit(LinkEvent::StateChanged(LinkState::Connected));
        remote.emit(LinkEvent::StateChanged(LinkState::Connected));
        debug!("memory links {} and {} connected", self.id, remote.id);

        let Some(label) = label else {
            return;
        };
        if self.options.stall_channel {
            debug!("memory link {} holds channel {} closed", self.id, label);
            return;
        }

        let open = Arc::new(AtomicBool::new(true));
        let local = Arc::new(MemoryChannel {
            label: label.clone(),
            open: open.clone(),
            local_events: self.events.clone(),
            remote_events: remote.events.clone(),
        });
        let far = Arc::new(MemoryChannel {
            label,
            open,
            local_events: remote.events.clone(),
            remote_events: self.events.clone(),
        });

        self.state.lock().channel = Some(local.clone());
        remote.state.lock().channel = Some(far.clone());

        self.emit(LinkEvent::ChannelOpen(local));
        remote.emit(LinkEvent::ChannelOpen(far));
    }
}

fn parse_link_id(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(LINK_MARKER))
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

fn parse_tracks(sdp: &str) -> BTreeMap<String, RemoteTrackInfo> {
    sdp.lines()
        .filter_map(|line| line.trim().strip_prefix(TRACK_MARKER))
        .filter_map(|rest| {
            let mut parts = rest.split_whitespace();
            let track = RemoteTrackInfo {
                track_id: parts.next()?.to_string(),
                stream_id: parts.next()?.to_string(),
                kind: parts.next()?.to_string(),
            };
            Some((track.track_id.clone(), track))
        })
        .collect()
}

#[async_trait]
impl PeerLink for MemoryLink {
    fn link_id(&self) -> &str {
        &self.id
    }

    async fn create_offer(&self) -> Result<String> {
        self.ensure_open()?;
        let sdp = {
            let mut inner = self.state.lock();
            if inner.signaling == SignalingState::HaveRemoteOffer {
                return Err(Error::SdpError(format!(
                    "Failed to set local description: invalid proposed signaling state transition from {} applying local offer",
                    inner.signaling
                )));
            }
            inner.signaling = SignalingState::HaveLocalOffer;
            inner.revision += 1;
            self.descriptor(SdpKind::Offer, &inner)
        };
        self.start_gathering();
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        self.ensure_open()?;
        let sdp = {
            let mut inner = self.state.lock();
            if inner.signaling != SignalingState::HaveRemoteOffer {
                return Err(Error::SdpError(
                    "Failed to create answer: no remote offer applied".to_string(),
                ));
            }
            inner.signaling = SignalingState::Stable;
            inner.revision += 1;
            self.descriptor(SdpKind::Answer, &inner)
        };
        self.start_gathering();
        Ok(sdp)
    }

    async fn apply_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()> {
        self.ensure_open()?;

        let remote_id = parse_link_id(sdp).ok_or_else(|| {
            Error::SdpError("Failed to set remote description: unrecognized descriptor".to_string())
        })?;
        if remote_id == self.id {
            return Err(Error::SdpError(
                "Failed to set remote description: descriptor belongs to this link".to_string(),
            ));
        }

        let network = self
            .network
            .upgrade()
            .ok_or_else(|| Error::WebRtcError("memory network dropped".to_string()))?;
        let remote = network
            .links
            .lock()
            .get(remote_id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                Error::SdpError(format!(
                    "Failed to set remote description: no link {}",
                    remote_id
                ))
            })?;

        let offered = parse_tracks(sdp);
        let (pair, added, ended) = {
            let mut inner = self.state.lock();
            if let Some(current) = inner.remote.as_ref().and_then(Weak::upgrade) {
                if current.id != remote.id {
                    return Err(Error::SdpError(format!(
                        "Failed to set remote description: link {} is paired with {}",
                        self.id, current.id
                    )));
                }
            }
            let next = match (kind, inner.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (kind, from) => {
                    return Err(Error::SdpError(format!(
                        "Failed to set remote description: invalid proposed signaling state transition from {} applying remote {}",
                        from,
                        kind_name(kind)
                    )));
                }
            };
            inner.signaling = next;
            inner.remote = Some(Arc::downgrade(&remote));

            let pair = match (kind, inner.state()) {
                (SdpKind::Offer, LinkState::New) => {
                    inner.state = Some(LinkState::Connecting);
                    false
                }
                (SdpKind::Answer, LinkState::New) | (SdpKind::Answer, LinkState::Connecting) => {
                    true
                }
                _ => false,
            };

            let added: Vec<RemoteTrackInfo> = offered
                .values()
                .filter(|track| !inner.remote_tracks.contains_key(&track.track_id))
                .cloned()
                .collect();
            let ended: Vec<String> = inner
                .remote_tracks
                .keys()
                .filter(|track_id| !offered.contains_key(*track_id))
                .cloned()
                .collect();
            inner.remote_tracks = offered;
            (pair, added, ended)
        };

        if pair {
            self.pair_with(&remote);
        }
        for track in added {
            self.emit(LinkEvent::RemoteTrack(track));
        }
        for track_id in ended {
            self.emit(LinkEvent::RemoteTrackEnded { track_id });
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: &CandidateRecord) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::IceCandidateError(format!(
                "link {} is closed",
                self.id
            )));
        }
        self.state.lock().remote_candidates.push(candidate.clone());
        Ok(())
    }

    async fn open_channel(&self, label: &str) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().channel_label = Some(label.to_string());
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<String> {
        self.ensure_open()?;

        let mut inner = self.state.lock();
        if inner.state() != LinkState::Connected {
            return Err(Error::MediaTrackError(format!(
                "link {} is not connected",
                self.id
            )));
        }
        inner.next_sender += 1;
        let sender_id = format!("{}-sender-{}", self.id, inner.next_sender);
        inner.senders.insert(
            sender_id.clone(),
            RemoteTrackInfo {
                track_id: track.id().to_string(),
                stream_id: track.stream_id().to_string(),
                kind: track.kind().to_string(),
            },
        );
        Ok(sender_id)
    }

    async fn remove_track(&self, sender_id: &str) -> Result<()> {
        self.state.lock().senders.remove(sender_id);
        Ok(())
    }

    async fn reserve_inbound_video(&self) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().receive_slots += 1;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let channel = {
            let mut inner = self.state.lock();
            inner.state = Some(LinkState::Closed);
            inner.senders.clear();
            inner.channel.take()
        };
        if let Some(channel) = channel {
            channel.close().await?;
        }

        self.emit(LinkEvent::StateChanged(LinkState::Closed));
        debug!("memory link {} closed", self.id);
        Ok(())
    }
}

/// One end of an in-process data channel
pub struct MemoryChannel {
    label: String,
    open: Arc<AtomicBool>,
    local_events: broadcast::Sender<LinkEvent>,
    remote_events: broadcast::Sender<LinkEvent>,
}

#[async_trait]
impl DataLink for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::DataChannelError(format!(
                "channel {} is not open",
                self.label
            )));
        }
        let _ = self
            .remote_events
            .send(LinkEvent::ChannelMessage(text.to_string()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.local_events.send(LinkEvent::ChannelClosed);
            let _ = self.remote_events.send(LinkEvent::ChannelClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LocalVideoTrack;

    async fn next_matching<F>(rx: &mut broadcast::Receiver<LinkEvent>, mut pred: F) -> LinkEvent
    where
        F: FnMut(&LinkEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not received")
    }

    async fn connected_pair(network: &MemoryNetwork) -> (Arc<dyn PeerLink>, Arc<dyn PeerLink>) {
        let a = network.create().await.unwrap();
        let b = network.create().await.unwrap();
        a.open_channel("messages").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        b.apply_remote_description(SdpKind::Offer, &offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.apply_remote_description(SdpKind::Answer, &answer).await.unwrap();
        (a, b)
    }

    #[test]
    fn test_parse_link_id() {
        let sdp = "v=0\r\na=memory-link:mem-7\r\na=type:offer\r\n";
        assert_eq!(parse_link_id(sdp), Some("mem-7"));
        assert_eq!(parse_link_id("v=0\r\n"), None);
    }

    #[test]
    fn test_unavailable_network_fails_availability_check() {
        let err = MemoryNetwork::unavailable().check_available().unwrap_err();
        assert!(matches!(err, Error::ConnectionSetupError(_)));
    }

    #[tokio::test]
    async fn test_gathering_emits_candidates_then_completes() {
        let network = MemoryNetwork::with_options(MemoryOptions {
            candidates: 3,
            ..Default::default()
        });
        let link = network.create().await.unwrap();
        let mut rx = link.subscribe();
        link.create_offer().await.unwrap();

        let mut candidates = 0;
        loop {
            match rx.recv().await.unwrap() {
                LinkEvent::Candidate(_) => candidates += 1,
                LinkEvent::GatheringComplete => break,
                _ => {}
            }
        }
        assert_eq!(candidates, 3);
    }

    #[tokio::test]
    async fn test_answer_pairs_links_and_opens_channel() {
        let network = MemoryNetwork::new();
        let a = network.create().await.unwrap();
        let b = network.create().await.unwrap();
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();

        a.open_channel("messages").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        b.apply_remote_description(SdpKind::Offer, &offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.apply_remote_description(SdpKind::Answer, &answer).await.unwrap();

        let a_channel = match next_matching(&mut a_rx, |e| matches!(e, LinkEvent::ChannelOpen(_))).await {
            LinkEvent::ChannelOpen(channel) => channel,
            _ => unreachable!(),
        };
        assert_eq!(a_channel.label(), "messages");
        next_matching(&mut b_rx, |e| matches!(e, LinkEvent::ChannelOpen(_))).await;

        a_channel.send_text("hello").await.unwrap();
        match next_matching(&mut b_rx, |e| matches!(e, LinkEvent::ChannelMessage(_))).await {
            LinkEvent::ChannelMessage(text) => assert_eq!(text, "hello"),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let network = MemoryNetwork::new();
        let link = network.create().await.unwrap();
        assert!(matches!(link.create_answer().await, Err(Error::SdpError(_))));
    }

    #[tokio::test]
    async fn test_foreign_descriptor_rejected() {
        let network = MemoryNetwork::new();
        let link = network.create().await.unwrap();
        let err = link
            .apply_remote_description(SdpKind::Offer, "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SdpError(_)));
    }

    #[tokio::test]
    async fn test_stalled_channel_never_opens() {
        let network = MemoryNetwork::with_options(MemoryOptions {
            stall_channel: true,
            ..Default::default()
        });
        let a = network.create().await.unwrap();
        let mut rx = a.subscribe();
        let b = network.create().await.unwrap();
        a.open_channel("messages").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        b.apply_remote_description(SdpKind::Offer, &offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.apply_remote_description(SdpKind::Answer, &answer).await.unwrap();

        next_matching(&mut rx, |e| matches!(e, LinkEvent::StateChanged(LinkState::Connected))).await;
        let opened = tokio::time::timeout(Duration::from_millis(100), async {
            loop {
                if let Ok(LinkEvent::ChannelOpen(_)) = rx.recv().await {
                    return;
                }
            }
        })
        .await;
        assert!(opened.is_err());
    }

    async fn renegotiate(offerer: &Arc<dyn PeerLink>, answerer: &Arc<dyn PeerLink>) {
        let offer = offerer.create_offer().await.unwrap();
        answerer
            .apply_remote_description(SdpKind::Offer, &offer)
            .await
            .unwrap();
        let answer = answerer.create_answer().await.unwrap();
        offerer
            .apply_remote_description(SdpKind::Answer, &answer)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tracks_surface_after_renegotiation() {
        let network = MemoryNetwork::new();
        let (a, b) = connected_pair(&network).await;
        let mut b_rx = b.subscribe();

        let sender = a
            .add_track(Arc::new(LocalVideoTrack::new("screen", "stream-1")))
            .await
            .unwrap();
        let early = tokio::time::timeout(Duration::from_millis(50), async {
            loop {
                if let Ok(LinkEvent::RemoteTrack(_)) = b_rx.recv().await {
                    return;
                }
            }
        })
        .await;
        assert!(early.is_err(), "track must wait for a descriptor");

        renegotiate(&a, &b).await;
        match next_matching(&mut b_rx, |e| matches!(e, LinkEvent::RemoteTrack(_))).await {
            LinkEvent::RemoteTrack(info) => {
                assert_eq!(info.track_id, "screen");
                assert_eq!(info.stream_id, "stream-1");
                assert_eq!(info.kind, "video");
            }
            _ => unreachable!(),
        }

        a.remove_track(&sender).await.unwrap();
        a.remove_track(&sender).await.unwrap();
        renegotiate(&a, &b).await;
        match next_matching(&mut b_rx, |e| matches!(e, LinkEvent::RemoteTrackEnded { .. })).await {
            LinkEvent::RemoteTrackEnded { track_id } => assert_eq!(track_id, "screen"),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_answering_side_tracks_ride_the_answer() {
        let network = MemoryNetwork::new();
        let (a, b) = connected_pair(&network).await;
        let mut a_rx = a.subscribe();

        b.add_track(Arc::new(LocalVideoTrack::new("phone-screen", "stream-2")))
            .await
            .unwrap();
        a.reserve_inbound_video().await.unwrap();
        renegotiate(&a, &b).await;

        match next_matching(&mut a_rx, |e| matches!(e, LinkEvent::RemoteTrack(_))).await {
            LinkEvent::RemoteTrack(info) => assert_eq!(info.track_id, "phone-screen"),
            _ => unreachable!(),
        }
        assert_eq!(network.link(a.link_id()).unwrap().receive_slots(), 1);
    }

    #[tokio::test]
    async fn test_answer_without_outstanding_offer_is_rejected() {
        let network = MemoryNetwork::new();
        let (a, b) = connected_pair(&network).await;

        let offer = a.create_offer().await.unwrap();
        b.apply_remote_description(SdpKind::Offer, &offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.apply_remote_description(SdpKind::Answer, &answer).await.unwrap();

        let err = a
            .apply_remote_description(SdpKind::Answer, &answer)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("from stable applying remote answer"));
        let link = network.link(a.link_id()).unwrap();
        assert_eq!(link.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_crossing_offers_are_rejected() {
        let network = MemoryNetwork::new();
        let (a, b) = connected_pair(&network).await;

        let a_offer = a.create_offer().await.unwrap();
        let b_offer = b.create_offer().await.unwrap();

        let err = a
            .apply_remote_description(SdpKind::Offer, &b_offer)
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("from have-local-offer applying remote offer"));
        assert!(b
            .apply_remote_description(SdpKind::Offer, &a_offer)
            .await
            .is_err());
        assert_eq!(
            network.link(a.link_id()).unwrap().signaling_state(),
            SignalingState::HaveLocalOffer
        );
    }

    #[tokio::test]
    async fn test_close_closes_channel_on_both_sides() {
        let network = MemoryNetwork::new();
        let (a, b) = connected_pair(&network).await;
        let mut b_rx = b.subscribe();

        a.close().await.unwrap();
        a.close().await.unwrap();
        next_matching(&mut b_rx, |e| matches!(e, LinkEvent::ChannelClosed)).await;

        let link = network.link(a.link_id()).unwrap();
        assert_eq!(link.state(), LinkState::Closed);
        assert!(a.create_offer().await.is_err());
    }
}
