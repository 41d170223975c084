//! Typed messaging over each session's data channel
//!
//! Outbound messages go to the channel of the named peer, but only while it
//! reports open. Inbound text is parsed, broadcast to subscribers and then
//! handed to the handlers registered for its `type`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::messages::{ControlMessage, MAX_MESSAGE_SIZE};
use crate::peer::PeerRegistry;

/// Handler invoked with the sending peer and the parsed message
pub type MessageHandler = Arc<dyn Fn(String, ControlMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// A message received from a peer
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub peer_id: String,
    pub message: ControlMessage,
}

const KNOWN_TYPES: [&str; 7] = [
    "custom_message",
    "screen_share_request",
    "screen_share_response",
    "screen_share_started",
    "screen_share_stopped",
    "session_description",
    "renegotiation_request",
];

pub struct DataChannelBus {
    registry: Arc<PeerRegistry>,
    handlers: RwLock<HashMap<String, Vec<MessageHandler>>>,
    inbound: broadcast::Sender<InboundMessage>,
}

impl DataChannelBus {
    pub fn new(registry: Arc<PeerRegistry>, capacity: usize) -> Self {
        let (inbound, _) = broadcast::channel(capacity);
        Self {
            registry,
            handlers: RwLock::new(HashMap::new()),
            inbound,
        }
    }

    /// Serialize and write `message` to `peer_id`
    ///
    /// Returns false when there is no session, its channel is not open, the
    /// message is too large or the write fails. None of these are errors.
    pub async fn send(&self, peer_id: &str, message: &ControlMessage) -> bool {
        let Some(session) = self.registry.get(peer_id).await else {
            debug!("No session for {}; dropping {}", peer_id, message.kind());
            return false;
        };
        let Some(channel) = session.channel().filter(|c| c.is_open()) else {
            debug!("Channel to {} is not open; dropping {}", peer_id, message.kind());
            return false;
        };

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize {} for {}: {}", message.kind(), peer_id, e);
                return false;
            }
        };
        if text.len() > MAX_MESSAGE_SIZE {
            warn!(
                "Refusing {} to {}: {} bytes exceeds {} byte limit",
                message.kind(),
                peer_id,
                text.len(),
                MAX_MESSAGE_SIZE
            );
            return false;
        }

        match channel.send_text(&text).await {
            Ok(()) => {
                trace!("Sent {} to {}", message.kind(), peer_id);
                true
            }
            Err(e) => {
                warn!("Failed to send {} to {}: {}", message.kind(), peer_id, e);
                false
            }
        }
    }

    pub async fn send_custom(&self, peer_id: &str, text: impl Into<String>) -> bool {
        self.send(peer_id, &ControlMessage::custom(text)).await
    }

    pub async fn request_screen_share(&self, peer_id: &str) -> bool {
        self.send(peer_id, &ControlMessage::screen_share_request()).await
    }

    pub async fn respond_screen_share(&self, peer_id: &str, accepted: bool) -> bool {
        self.send(peer_id, &ControlMessage::screen_share_response(accepted))
            .await
    }

    /// Register `handler` for messages whose `type` is `kind`
    ///
    /// Handlers for the same type run in registration order.
    pub fn on_message<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(String, ControlMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(
            move |peer_id: String, message: ControlMessage| -> BoxFuture<'static, ()> {
                Box::pin(handler(peer_id, message))
            },
        );
        self.handlers
            .write()
            .entry(kind.to_string())
            .or_default()
            .push(handler);
    }

    /// Every inbound message, regardless of type
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    /// Route raw channel text received from `peer_id`
    pub async fn dispatch(&self, peer_id: &str, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping unparseable message from {}: {}", peer_id, e);
                return;
            }
        };
        let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
            warn!("Dropping message without type from {}", peer_id);
            return;
        };
        if !KNOWN_TYPES.contains(&kind) {
            warn!("Dropping message of unknown type {} from {}", kind, peer_id);
            return;
        }

        let message: ControlMessage = match serde_json::from_value(value.clone()) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed {} from {}: {}", kind, peer_id, e);
                return;
            }
        };

        trace!("Received {} from {}", message.kind(), peer_id);
        let _ = self.inbound.send(InboundMessage {
            peer_id: peer_id.to_string(),
            message: message.clone(),
        });

        let handlers = self
            .handlers
            .read()
            .get(message.kind())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(peer_id.to_string(), message.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionFactory, DataLink, MemoryNetwork};
    use crate::peer::PeerSession;
    use crate::session::state::HandshakeRole;
    use crate::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingChannel {
        open: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DataLink for RecordingChannel {
        fn label(&self) -> &str {
            "messages"
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send_text(&self, text: &str) -> Result<()> {
            self.sent.lock().push(text.to_string());
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn bus_with_channel(open: bool) -> (DataChannelBus, Arc<RecordingChannel>) {
        let registry = Arc::new(PeerRegistry::new(4).unwrap());
        let link = MemoryNetwork::new().create().await.unwrap();
        let session = Arc::new(PeerSession::new("B1", HandshakeRole::Offerer, link));
        let channel = Arc::new(RecordingChannel {
            open: AtomicBool::new(open),
            sent: Mutex::new(Vec::new()),
        });
        session.set_channel(channel.clone());
        registry.register("B1", session).await.unwrap();
        (DataChannelBus::new(registry, 16), channel)
    }

    #[tokio::test]
    async fn test_send_writes_when_open() {
        let (bus, channel) = bus_with_channel(true).await;
        assert!(bus.send_custom("B1", "hi").await);
        let sent = channel.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains(r#""type":"custom_message""#));
    }

    #[tokio::test]
    async fn test_send_returns_false_when_closed_or_missing() {
        let (bus, channel) = bus_with_channel(false).await;
        assert!(!bus.send_custom("B1", "hi").await);
        assert!(!bus.send_custom("Z9", "hi").await);
        assert!(channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_message_refused() {
        let (bus, channel) = bus_with_channel(true).await;
        let big = "x".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(!bus.send_custom("B1", big).await);
        assert!(channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_by_type() {
        let (bus, _) = bus_with_channel(true).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on_message("custom_message", move |peer, msg| {
            let sink = sink.clone();
            async move {
                if let ControlMessage::CustomMessage { message, .. } = msg {
                    sink.lock().push((peer, message));
                }
            }
        });

        bus.dispatch("B1", r#"{"type":"custom_message","message":"hello","timestamp":1}"#)
            .await;
        bus.dispatch("B1", r#"{"type":"screen_share_stopped","timestamp":2}"#)
            .await;

        assert_eq!(
            seen.lock().clone(),
            vec![("B1".to_string(), "hello".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_are_dropped() {
        let (bus, _) = bus_with_channel(true).await;
        let mut inbound = bus.subscribe();

        bus.dispatch("B1", r#"{"type":"file_transfer"}"#).await;
        bus.dispatch("B1", r#"{"message":"no type"}"#).await;
        bus.dispatch("B1", "not json").await;
        bus.dispatch("B1", r#"{"type":"screen_share_started"}"#).await;
        bus.dispatch("B1", r#"{"type":"screen_share_request","timestamp":5}"#)
            .await;

        let received = inbound.recv().await.unwrap();
        assert_eq!(received.peer_id, "B1");
        assert_eq!(received.message.kind(), "screen_share_request");
        assert!(inbound.try_recv().is_err());
    }
}
