//! Data channel messaging

pub mod bus;
pub mod messages;

pub use bus::{DataChannelBus, InboundMessage, MessageHandler};
pub use messages::{ControlMessage, ShareResponseStatus, MAX_MESSAGE_SIZE};
