//! WebSocket relay client

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::identity::DeviceIdentity;
use crate::signaling::relay::{
    JsonRpcError, JsonRpcResponse, RelayConnector, RelayFrame, RelaySession, ANNOUNCE_REQUEST_ID,
};
use crate::{Error, Result};

/// Connects to a [`RelayServer`](super::RelayServer) at `url`
#[derive(Debug, Clone)]
pub struct WebSocketRelay {
    url: String,
}

impl WebSocketRelay {
    /// # Arguments
    ///
    /// * `url` - Relay URL (ws:// or wss://)
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RelayConnector for WebSocketRelay {
    async fn connect(&self, device: &DeviceIdentity) -> Result<RelaySession> {
        info!("Connecting to relay: {}", self.url);

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::RelayError(format!("Failed to connect to {}: {}", self.url, e)))?;
        let (mut write, mut read) = ws_stream.split();

        let announce = RelayFrame::Register {
            device_id: device.device_id.clone(),
            device_name: device.device_name.clone(),
        }
        .encode()?;
        write
            .send(Message::Text(announce))
            .await
            .map_err(|e| Error::RelayError(format!("Failed to announce: {}", e)))?;

        // The relay acknowledges the announce before forwarding anything.
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&text) {
                        if response.id == serde_json::Value::from(ANNOUNCE_REQUEST_ID) {
                            break;
                        }
                        continue;
                    }
                    if let Ok(refusal) = serde_json::from_str::<JsonRpcError>(&text) {
                        return Err(Error::RelayError(format!(
                            "relay refused registration ({}): {}",
                            refusal.error.code, refusal.error.message
                        )));
                    }
                    debug!("Ignoring relay message before registration: {}", text);
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(Error::RelayError(
                        "relay closed the connection during registration".to_string(),
                    ));
                }
                Some(Err(e)) => {
                    return Err(Error::RelayError(format!("relay connection failed: {}", e)));
                }
                Some(Ok(_)) => {}
            }
        }
        info!("Registered with relay as {}", device.device_id);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<RelayFrame>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let leaving = matches!(frame, RelayFrame::Disconnect { .. });
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping relay frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    error!("Failed to send relay message: {}", e);
                    break;
                }
                if leaving {
                    let _ = write.close().await;
                    break;
                }
            }
            debug!("Relay writer terminated");
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match RelayFrame::decode(&text) {
                        Ok(frame) => {
                            if inbound_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring relay message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Relay connection closed");
                        break;
                    }
                    Err(e) => {
                        error!("Relay connection error: {}", e);
                        break;
                    }
                    Ok(_) => {}
                }
            }
            debug!("Relay reader terminated");
        });

        Ok(RelaySession::new(outbound_tx, inbound_rx, vec![writer, reader]))
    }
}
