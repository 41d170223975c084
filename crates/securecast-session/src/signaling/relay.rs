//! Relay protocol for brokered signaling
//!
//! Devices register with a relay under their device id and address
//! envelopes and trickled candidates to each other by id. Frames travel as
//! JSON-RPC 2.0 notifications; only the registration is a request and is
//! acknowledged by the relay.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::envelope::{CandidateRecord, EnvelopeKind, SignalingEnvelope};
use crate::identity::DeviceIdentity;
use crate::{Error, Result};

/// JSON-RPC 2.0 protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// Request id used for the registration handshake
pub const ANNOUNCE_REQUEST_ID: &str = "announce";

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
    /// Absent for notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 response (success)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub result: serde_json::Value,
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub jsonrpc: String,
    pub error: ErrorObject,
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Standard JSON-RPC 2.0 error codes plus relay specific ones
pub mod error_codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;

    /// The JSON sent is not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;

    /// The method does not exist / is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Another connection already registered this device id
    pub const DEVICE_ID_TAKEN: i32 = -32001;
}

/// Methods carried over the relay
pub mod methods {
    pub const ANNOUNCE: &str = "peer.announce";
    pub const OFFER: &str = "peer.offer";
    pub const ANSWER: &str = "peer.answer";
    pub const ICE_CANDIDATE: &str = "peer.ice_candidate";
    pub const DISCONNECT: &str = "peer.disconnect";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnounceParams {
    pub peer_id: String,
    pub device_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvelopeParams {
    pub to: String,
    pub envelope: SignalingEnvelope,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceCandidateParams {
    pub from: String,
    pub to: String,
    pub candidate: CandidateRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisconnectParams {
    pub peer_id: String,
}

/// A unit of relay traffic
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    /// Register the sending device with the relay
    Register {
        device_id: String,
        device_name: String,
    },
    /// Handshake envelope for `to`; the sender is `envelope.device_id`
    Envelope {
        to: String,
        envelope: SignalingEnvelope,
    },
    /// Candidate discovered after the envelope went out
    Candidate {
        from: String,
        to: String,
        candidate: CandidateRecord,
    },
    /// The sending device is leaving the relay
    Disconnect { device_id: String },
}

impl RelayFrame {
    /// Device the relay should forward this frame to
    pub fn recipient(&self) -> Option<&str> {
        match self {
            RelayFrame::Envelope { to, .. } | RelayFrame::Candidate { to, .. } => Some(to),
            RelayFrame::Register { .. } | RelayFrame::Disconnect { .. } => None,
        }
    }

    /// Device the frame claims to come from
    pub fn sender(&self) -> &str {
        match self {
            RelayFrame::Register { device_id, .. } | RelayFrame::Disconnect { device_id } => {
                device_id
            }
            RelayFrame::Envelope { envelope, .. } => &envelope.device_id,
            RelayFrame::Candidate { from, .. } => from,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            RelayFrame::Register { .. } => methods::ANNOUNCE,
            RelayFrame::Envelope { envelope, .. } => match envelope.kind {
                EnvelopeKind::Offer => methods::OFFER,
                EnvelopeKind::Answer => methods::ANSWER,
            },
            RelayFrame::Candidate { .. } => methods::ICE_CANDIDATE,
            RelayFrame::Disconnect { .. } => methods::DISCONNECT,
        }
    }

    /// Map to a JSON-RPC request; registration carries an id, everything else is a notification
    pub fn to_request(&self) -> Result<JsonRpcRequest> {
        let params = match self {
            RelayFrame::Register {
                device_id,
                device_name,
            } => serde_json::to_value(AnnounceParams {
                peer_id: device_id.clone(),
                device_name: device_name.clone(),
            }),
            RelayFrame::Envelope { to, envelope } => serde_json::to_value(EnvelopeParams {
                to: to.clone(),
                envelope: envelope.clone(),
            }),
            RelayFrame::Candidate {
                from,
                to,
                candidate,
            } => serde_json::to_value(IceCandidateParams {
                from: from.clone(),
                to: to.clone(),
                candidate: candidate.clone(),
            }),
            RelayFrame::Disconnect { device_id } => serde_json::to_value(DisconnectParams {
                peer_id: device_id.clone(),
            }),
        }
        .map_err(|e| Error::SerializationError(format!("Failed to encode relay frame: {}", e)))?;

        let id = match self {
            RelayFrame::Register { .. } => Some(serde_json::Value::from(ANNOUNCE_REQUEST_ID)),
            _ => None,
        };

        Ok(JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: self.method().to_string(),
            params,
            id,
        })
    }

    pub fn from_request(request: JsonRpcRequest) -> Result<Self> {
        if request.jsonrpc != JSONRPC_VERSION {
            return Err(Error::RelayError(format!(
                "unsupported jsonrpc version {}",
                request.jsonrpc
            )));
        }

        fn params<T: serde::de::DeserializeOwned>(method: &str, value: serde_json::Value) -> Result<T> {
            serde_json::from_value(value)
                .map_err(|e| Error::RelayError(format!("invalid params for {}: {}", method, e)))
        }

        let frame = match request.method.as_str() {
            methods::ANNOUNCE => {
                let p: AnnounceParams = params(&request.method, request.params)?;
                RelayFrame::Register {
                    device_id: p.peer_id,
                    device_name: p.device_name,
                }
            }
            methods::OFFER | methods::ANSWER => {
                let p: EnvelopeParams = params(&request.method, request.params)?;
                let expected = if request.method == methods::OFFER {
                    EnvelopeKind::Offer
                } else {
                    EnvelopeKind::Answer
                };
                if p.envelope.kind != expected {
                    return Err(Error::RelayError(format!(
                        "{} carries an {} envelope",
                        request.method, p.envelope.kind
                    )));
                }
                RelayFrame::Envelope {
                    to: p.to,
                    envelope: p.envelope,
                }
            }
            methods::ICE_CANDIDATE => {
                let p: IceCandidateParams = params(&request.method, request.params)?;
                RelayFrame::Candidate {
                    from: p.from,
                    to: p.to,
                    candidate: p.candidate,
                }
            }
            methods::DISCONNECT => {
                let p: DisconnectParams = params(&request.method, request.params)?;
                RelayFrame::Disconnect {
                    device_id: p.peer_id,
                }
            }
            other => {
                return Err(Error::RelayError(format!("unknown relay method {}", other)));
            }
        };

        Ok(frame)
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(&self.to_request()?)
            .map_err(|e| Error::SerializationError(format!("Failed to encode relay frame: {}", e)))
    }

    pub fn decode(text: &str) -> Result<Self> {
        let request: JsonRpcRequest = serde_json::from_str(text)
            .map_err(|e| Error::RelayError(format!("invalid relay message: {}", e)))?;
        Self::from_request(request)
    }
}

/// Sending half of a relay connection
pub type RelaySender = mpsc::UnboundedSender<RelayFrame>;

/// An established relay registration
pub struct RelaySession {
    pub outbound: RelaySender,
    pub inbound: mpsc::UnboundedReceiver<RelayFrame>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelaySession {
    pub fn new(
        outbound: RelaySender,
        inbound: mpsc::UnboundedReceiver<RelayFrame>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks,
        }
    }

    pub fn into_parts(
        self,
    ) -> (
        RelaySender,
        mpsc::UnboundedReceiver<RelayFrame>,
        Vec<JoinHandle<()>>,
    ) {
        (self.outbound, self.inbound, self.tasks)
    }
}

/// Opens relay registrations
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, device: &DeviceIdentity) -> Result<RelaySession>;
}

/// In-process relay, used by tests and the demo
#[derive(Clone, Default)]
pub struct MemoryRelay {
    peers: Arc<Mutex<HashMap<String, RelaySender>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently registered device ids
    pub fn registered(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(&self, device: &DeviceIdentity) -> Result<RelaySession> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<RelayFrame>();

        {
            let mut peers = self.peers.lock();
            if peers.contains_key(&device.device_id) {
                return Err(Error::RelayError(format!(
                    "device {} is already registered",
                    device.device_id
                )));
            }
            peers.insert(device.device_id.clone(), inbound_tx);
        }
        debug!("Memory relay registered {}", device.device_id);

        let peers = self.peers.clone();
        let device_id = device.device_id.clone();
        let router = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if frame.sender() != device_id {
                    warn!(
                        "Relay dropping {} from {} claiming to be {}",
                        frame.method(),
                        device_id,
                        frame.sender()
                    );
                    continue;
                }
                match frame.recipient().map(str::to_string) {
                    Some(to) => {
                        let target = peers.lock().get(&to).cloned();
                        match target {
                            Some(tx) => {
                                let _ = tx.send(frame);
                            }
                            None => warn!("Relay dropping {} for unknown device {}", frame.method(), to),
                        }
                    }
                    None => {
                        if matches!(frame, RelayFrame::Disconnect { .. }) {
                            break;
                        }
                    }
                }
            }
            peers.lock().remove(&device_id);
            debug!("Memory relay unregistered {}", device_id);
        });

        Ok(RelaySession::new(outbound_tx, inbound_rx, vec![router]))
    }
}
