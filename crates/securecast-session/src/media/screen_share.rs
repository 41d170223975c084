//! Sharing this device's screen with connected peers

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, instrument};

use super::capture::{CaptureStart, CaptureStatus, ScreenCapture};
use super::negotiator::MediaNegotiator;
use crate::error::PermissionDenial;
use crate::{Error, Result};

/// Drives a [`ScreenCapture`] and attaches its track to peers
///
/// One capture is shared by every peer; it stops once the last peer stops
/// receiving it.
pub struct ScreenShare {
    capture: Arc<dyn ScreenCapture>,
    negotiator: Arc<MediaNegotiator>,
    current: Mutex<Option<CaptureStart>>,
}

impl ScreenShare {
    pub fn new(capture: Arc<dyn ScreenCapture>, negotiator: Arc<MediaNegotiator>) -> Self {
        Self {
            capture,
            negotiator,
            current: Mutex::new(None),
        }
    }

    /// Start sharing with `peer_id`
    ///
    /// # Errors
    ///
    /// `PermissionDenied(Unsupported)` when the device cannot capture,
    /// `PermissionDenied(Declined)` when the user refuses, plus anything
    /// [`MediaNegotiator::attach`] returns.
    #[instrument(skip(self))]
    pub async fn start(&self, peer_id: &str) -> Result<()> {
        if !self.capture.is_supported() {
            return Err(Error::PermissionDenied(PermissionDenial::Unsupported));
        }
        if !self.capture.request_permission().await {
            return Err(Error::PermissionDenied(PermissionDenial::Declined));
        }

        let mut current = self.current.lock().await;
        let capture = match current.as_ref() {
            Some(running) if !running.track.is_stopped() => running.clone(),
            _ => {
                let started = self.capture.start().await?;
                *current = Some(started.clone());
                started
            }
        };

        if let Err(e) = self.negotiator.attach(peer_id, capture.track.clone()).await {
            if self.negotiator.active_outbound().await.is_empty() {
                self.capture.stop().await;
                *current = None;
            }
            return Err(e);
        }

        info!("Sharing screen stream {} with {}", capture.stream_id, peer_id);
        Ok(())
    }

    /// Stop sharing with `peer_id`; idempotent
    #[instrument(skip(self))]
    pub async fn stop(&self, peer_id: &str) -> Result<()> {
        let mut current = self.current.lock().await;
        self.negotiator.detach(peer_id).await?;

        if current.is_some() && self.negotiator.active_outbound().await.is_empty() {
            self.capture.stop().await;
            *current = None;
            info!("No peer receives the screen any more; capture stopped");
        }
        Ok(())
    }

    /// Stop sharing with every peer and stop the capture
    pub async fn stop_all(&self) -> Result<()> {
        let mut current = self.current.lock().await;
        for session in self.negotiator.active_outbound().await {
            self.negotiator.detach(&session.peer_id()).await?;
        }
        self.capture.stop().await;
        *current = None;
        Ok(())
    }

    pub fn status(&self) -> CaptureStatus {
        self.capture.status()
    }
}
