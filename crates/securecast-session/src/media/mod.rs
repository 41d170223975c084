//! Media tracks, screen capture and track negotiation

pub mod capture;
pub mod negotiator;
pub mod screen_share;
pub mod track;

pub use capture::{CaptureStart, CaptureStatus, ScreenCapture, SyntheticCapture};
pub use negotiator::{MediaNegotiator, ScreenShareAssociation};
pub use screen_share::ScreenShare;
pub use track::{LocalVideoTrack, MediaTrack};
