//! Application lifecycle integration

pub mod reconciler;

pub use reconciler::{AppPhase, BackgroundReconciler, ShareStatus, SharedDevice, SharingStatus};
