//! webrtc-rs backed connection primitive

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectionFactory, DataLink, LinkEvent, LinkState, PeerLink, RemoteTrackInfo, SdpKind,
    LINK_EVENT_CAPACITY,
};
use crate::config::SessionConfig;
use crate::media::MediaTrack;
use crate::signaling::CandidateRecord;
use crate::{Error, Result};

/// Builds webrtc-rs peer connections from a [`SessionConfig`]
pub struct RtcConnectionFactory {
    ice_servers: Vec<RTCIceServer>,
    include_loopback: bool,
}

impl RtcConnectionFactory {
    pub fn new(config: &SessionConfig) -> Self {
        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        Self {
            ice_servers,
            include_loopback: config.include_loopback_candidates,
        }
    }

    fn build_api(&self) -> Result<API> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_include_loopback_candidate(self.include_loopback);

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .with_setting_engine(setting_engine)
            .build())
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    fn check_available(&self) -> Result<()> {
        self.build_api()
            .map(|_| ())
            .map_err(|e| Error::ConnectionSetupError(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn create(&self) -> Result<Arc<dyn PeerLink>> {
        let api = self
            .build_api()
            .map_err(|e| Error::ConnectionSetupError(e.to_string()))?;

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::ConnectionSetupError(format!("Failed to create peer connection: {}", e))
        })?);

        let link = RtcPeerLink::wire(peer_connection);
        info!("Created peer connection {}", link.id);
        Ok(link)
    }
}

/// One webrtc-rs peer connection
pub struct RtcPeerLink {
    id: String,
    peer_connection: Arc<RTCPeerConnection>,
    events: broadcast::Sender<LinkEvent>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    next_sender: AtomicU32,
    closed: AtomicBool,
}

impl RtcPeerLink {
    fn wire(peer_connection: Arc<RTCPeerConnection>) -> Arc<Self> {
        let (events, _) = broadcast::channel(LINK_EVENT_CAPACITY);
        let link = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer_connection,
            events,
            channel: Mutex::new(None),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        });

        let events = link.events.clone();
        link.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    match candidate {
                        Some(candidate) => match candidate.to_json() {
                            Ok(init) => {
                                let _ = events.send(LinkEvent::Candidate(CandidateRecord {
                                    candidate: init.candidate,
                                    sdp_mline_index: init.sdp_mline_index,
                                    sdp_mid: init.sdp_mid,
                                }));
                            }
                            Err(e) => warn!("Failed to serialize local candidate: {}", e),
                        },
                        None => {
                            let _ = events.send(LinkEvent::GatheringComplete);
                        }
                    }
                })
            }));

        let events = link.events.clone();
        let link_id = link.id.clone();
        link.peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let events = events.clone();
                let link_id = link_id.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => LinkState::New,
                        RTCPeerConnectionState::Connecting => LinkState::Connecting,
                        RTCPeerConnectionState::Connected => LinkState::Connected,
                        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                        RTCPeerConnectionState::Failed => LinkState::Failed,
                        RTCPeerConnectionState::Closed => LinkState::Closed,
                        _ => return,
                    };
                    debug!("Connection {} state: {:?}", link_id, state);
                    let _ = events.send(LinkEvent::StateChanged(state));
                })
            },
        ));

        // Answering side: the channel arrives from the remote offer
        let weak = Arc::downgrade(&link);
        link.peer_connection
            .on_data_channel(Box::new(move |data_channel: Arc<RTCDataChannel>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(link) = weak.upgrade() {
                        debug!(
                            "Connection {} received data channel {}",
                            link.id,
                            data_channel.label()
                        );
                        link.attach_channel(data_channel);
                    }
                })
            }));

        let events = link.events.clone();
        link.peer_connection
            .on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let events = events.clone();
                Box::pin(async move {
                    let info = RemoteTrackInfo {
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                        kind: track.kind().to_string(),
                    };
                    info!("Remote track {} ({})", info.track_id, info.kind);
                    let _ = events.send(LinkEvent::RemoteTrack(info.clone()));

                    // Drain RTP until the remote stops sending
                    tokio::spawn(async move {
                        while track.read_rtp().await.is_ok() {}
                        let _ = events.send(LinkEvent::RemoteTrackEnded {
                            track_id: info.track_id,
                        });
                    });
                })
            }));

        link
    }

    fn attach_channel(&self, data_channel: Arc<RTCDataChannel>) {
        let events = self.events.clone();
        let weak: Weak<RTCDataChannel> = Arc::downgrade(&data_channel);
        data_channel.on_open(Box::new(move || {
            let events = events.clone();
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(dc) = weak.upgrade() {
                    debug!("Data channel {} open", dc.label());
                    let _ = events.send(LinkEvent::ChannelOpen(Arc::new(RtcDataLink {
                        label: dc.label().to_string(),
                        data_channel: dc,
                    })));
                }
            })
        }));

        let events = self.events.clone();
        data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                if !msg.is_string {
                    debug!("Ignoring binary data channel message ({} bytes)", msg.data.len());
                    return;
                }
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(LinkEvent::ChannelMessage(text));
                    }
                    Err(e) => warn!("Dropping non UTF-8 text message: {}", e),
                }
            })
        }));

        let events = self.events.clone();
        data_channel.on_close(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(LinkEvent::ChannelClosed);
            })
        }));

        *self.channel.lock() = Some(data_channel);
    }

    async fn local_sdp(&self) -> Result<String> {
        self.peer_connection
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| Error::SdpError("No local description after negotiation".to_string()))
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    fn link_id(&self) -> &str {
        &self.id
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        self.local_sdp().await
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        self.local_sdp().await
    }

    async fn apply_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| Error::SdpError(format!("Failed to parse {:?}: {}", kind, e)))?;

        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_candidate(&self, candidate: &CandidateRecord) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn open_channel(&self, label: &str) -> Result<()> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };

        let data_channel = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;

        self.attach_channel(data_channel);
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<String> {
        let local = track.rtc_track().ok_or_else(|| {
            Error::MediaTrackError(format!("track {} has no RTP source", track.id()))
        })?;

        let sender = self
            .peer_connection
            .add_track(local)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add track: {}", e)))?;

        // RTCP must be read for interceptors to work
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        let sender_id = format!(
            "{}-sender-{}",
            self.id,
            self.next_sender.fetch_add(1, Ordering::SeqCst)
        );
        self.senders.lock().insert(sender_id.clone(), sender);
        Ok(sender_id)
    }

    async fn remove_track(&self, sender_id: &str) -> Result<()> {
        let sender = self.senders.lock().remove(sender_id);
        if let Some(sender) = sender {
            self.peer_connection
                .remove_track(&sender)
                .await
                .map_err(|e| Error::MediaTrackError(format!("Failed to remove track: {}", e)))?;
        }
        Ok(())
    }

    async fn reserve_inbound_video(&self) -> Result<()> {
        self.peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map(|_| ())
            .map_err(|e| Error::MediaTrackError(format!("Failed to add video receiver: {}", e)))
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing peer connection {}", self.id);
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!("Failed to close data channel: {}", e);
            }
        }
        self.senders.lock().clear();

        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close connection: {}", e)))
    }
}

/// Data channel handle handed to the session once open
pub struct RtcDataLink {
    label: String,
    data_channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataLink for RtcDataLink {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.data_channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.data_channel
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| Error::DataChannelError(format!("Failed to send message: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.data_channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close channel: {}", e)))
    }
}
