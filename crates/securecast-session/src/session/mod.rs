//! Session lifecycle: states and the machine that drives them

pub mod machine;
pub mod state;

pub use machine::{DebugInfo, SessionMachine};
pub use state::{HandshakeRole, SessionState};
