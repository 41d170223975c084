//! WebSocket relay server
//!
//! Every connection must first announce its device id. After that, each
//! envelope or candidate frame is forwarded verbatim to the connection
//! registered under the frame's `to`, provided the frame names the
//! connection's own device as its sender.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::signaling::relay::{
    error_codes, ErrorObject, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RelayFrame,
    JSONRPC_VERSION,
};
use crate::{Error, Result};

/// Outgoing queue per registered device
type Peers = Arc<RwLock<HashMap<String, mpsc::Sender<String>>>>;

pub struct RelayServer {
    listener: TcpListener,
    peers: Peers,
}

impl RelayServer {
    /// Bind the relay to `addr`; port 0 picks a free port
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            peers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until the handle is shut down
    pub fn start(self) -> Result<RelayServerHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let Self { listener, peers } = self;

        info!("Relay listening on ws://{}", local_addr);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                debug!("Accepted relay connection from {}", peer_addr);
                                let peers = Arc::clone(&peers);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, peers).await {
                                        warn!("Relay connection from {} ended: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => error!("Failed to accept relay connection: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Relay received shutdown signal");
                        break;
                    }
                }
            }
        });

        Ok(RelayServerHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

/// Handle for a running [`RelayServer`]
pub struct RelayServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl RelayServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL clients connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Stop accepting connections
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!("Relay accept loop ended abnormally: {}", e);
        }
        info!("Relay stopped");
    }
}

fn error_reply(code: i32, message: impl Into<String>, id: serde_json::Value) -> String {
    let reply = JsonRpcError {
        jsonrpc: JSONRPC_VERSION.to_string(),
        error: ErrorObject {
            code,
            message: message.into(),
            data: None,
        },
        id,
    };
    serde_json::to_string(&reply).unwrap_or_default()
}

async fn handle_connection(stream: TcpStream, peers: Peers) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| Error::RelayError(format!("WebSocket handshake failed: {}", e)))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, mut rx) = mpsc::channel::<String>(128);
    let forward_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                error!("Failed to send relay message: {}", e);
                break;
            }
        }
    });

    let mut device_id: Option<String> = None;

    while let Some(message) = ws_rx.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Relay connection error: {}", e);
                break;
            }
        };

        let request: JsonRpcRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                let _ = tx
                    .send(error_reply(error_codes::PARSE_ERROR, e.to_string(), json!(null)))
                    .await;
                continue;
            }
        };
        let request_id = request.id.clone().unwrap_or(json!(null));

        let frame = match RelayFrame::from_request(request) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Rejecting relay message: {}", e);
                let _ = tx
                    .send(error_reply(error_codes::METHOD_NOT_FOUND, e.to_string(), request_id))
                    .await;
                continue;
            }
        };

        match (device_id.clone(), frame) {
            (None, RelayFrame::Register { device_id: id, device_name }) => {
                {
                    let mut peers = peers.write().await;
                    if peers.contains_key(&id) {
                        drop(peers);
                        let _ = tx
                            .send(error_reply(
                                error_codes::DEVICE_ID_TAKEN,
                                format!("device id {} is already registered", id),
                                request_id,
                            ))
                            .await;
                        continue;
                    }
                    peers.insert(id.clone(), tx.clone());
                }

                info!("Relay registered {} ({})", id, device_name);
                let ack = JsonRpcResponse {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    result: json!({ "peer_id": id, "registered": true }),
                    id: request_id,
                };
                let _ = tx.send(serde_json::to_string(&ack).unwrap_or_default()).await;
                device_id = Some(id);
            }
            (None, other) => {
                let _ = tx
                    .send(error_reply(
                        error_codes::INVALID_REQUEST,
                        format!("{} before peer.announce", other.method()),
                        request_id,
                    ))
                    .await;
            }
            (Some(_), RelayFrame::Register { .. }) => {
                let _ = tx
                    .send(error_reply(
                        error_codes::INVALID_REQUEST,
                        "connection is already registered",
                        request_id,
                    ))
                    .await;
            }
            (Some(_), RelayFrame::Disconnect { .. }) => break,
            (Some(from), frame) if frame.sender() != from => {
                warn!(
                    "Rejecting {} from {} claiming to be {}",
                    frame.method(),
                    from,
                    frame.sender()
                );
                let _ = tx
                    .send(error_reply(
                        error_codes::INVALID_REQUEST,
                        format!("connection is registered as {}, not {}", from, frame.sender()),
                        request_id,
                    ))
                    .await;
            }
            (Some(from), frame) => {
                let Some(to) = frame.recipient() else {
                    continue;
                };
                let target = peers.read().await.get(to).cloned();
                match target {
                    Some(target) => {
                        debug!("Relaying {} from {} to {}", frame.method(), from, to);
                        if target.send(text).await.is_err() {
                            warn!("Relay could not deliver {} to {}", frame.method(), to);
                        }
                    }
                    None => warn!("Relay dropping {} for unknown device {}", frame.method(), to),
                }
            }
        }
    }

    if let Some(id) = device_id {
        peers.write().await.remove(&id);
        info!("Relay unregistered {}", id);
    }
    forward_task.abort();
    Ok(())
}
