//! Relay over WebSocket
//!
//! [`WebSocketRelay`] registers a device with a relay server and moves
//! [`RelayFrame`](super::RelayFrame)s as JSON-RPC text messages.
//! [`RelayServer`] is that server.

mod client;
mod server;

pub use client::WebSocketRelay;
pub use server::{RelayServer, RelayServerHandle};
