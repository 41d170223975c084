//! Peer sessions, their registry and candidate gathering

pub mod gatherer;
pub mod registry;
pub mod session;

pub use gatherer::{gather, Gathering};
pub use registry::PeerRegistry;
pub use session::{OutboundMedia, PeerSession};
pub(crate) use session::Renegotiation;
