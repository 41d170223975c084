//! Screen capture contract
//!
//! Platform capture lives outside this crate. The session layer only needs
//! to ask for permission, start and stop a capture, and get a track to
//! attach. [`SyntheticCapture`] stands in for a platform backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::track::{LocalVideoTrack, MediaTrack};
use crate::Result;

/// A running capture
#[derive(Clone)]
pub struct CaptureStart {
    pub stream_id: String,
    pub track: Arc<dyn MediaTrack>,
}

impl std::fmt::Debug for CaptureStart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStart")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track.id())
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStatus {
    pub is_capturing: bool,
    pub stream_id: Option<String>,
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    /// Whether this device can capture its screen at all
    fn is_supported(&self) -> bool;

    /// Ask the user for capture permission
    async fn request_permission(&self) -> bool;

    /// Start capturing, or return the running capture
    async fn start(&self) -> Result<CaptureStart>;

    /// Stop capturing; false when nothing was running
    async fn stop(&self) -> bool;

    fn status(&self) -> CaptureStatus;
}

struct Running {
    start: CaptureStart,
    video: Arc<LocalVideoTrack>,
    feeder: JoinHandle<()>,
}

/// Capture backend producing a synthetic frame stream
pub struct SyntheticCapture {
    supported: bool,
    grant: bool,
    frame_interval: Duration,
    next_stream: AtomicU64,
    running: Mutex<Option<Running>>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self {
            supported: true,
            grant: true,
            frame_interval: Duration::from_millis(100),
            next_stream: AtomicU64::new(1),
            running: Mutex::new(None),
        }
    }

    /// A device without capture support
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    /// A device whose user declines the permission prompt
    pub fn declining() -> Self {
        Self {
            grant: false,
            ..Self::new()
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Frames written by the running capture
    pub fn frames_written(&self) -> u64 {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.video.frames_written())
            .unwrap_or(0)
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScreenCapture for SyntheticCapture {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn request_permission(&self) -> bool {
        self.supported && self.grant
    }

    async fn start(&self) -> Result<CaptureStart> {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            if !current.video.is_stopped() {
                return Ok(current.start.clone());
            }
            current.feeder.abort();
        }

        let n = self.next_stream.fetch_add(1, Ordering::SeqCst);
        let stream_id = format!("screen-{}", n);
        let video = Arc::new(LocalVideoTrack::new(&format!("screen-video-{}", n), &stream_id));

        let feeder = {
            let video = video.clone();
            let interval = self.frame_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                while !video.is_stopped() {
                    ticker.tick().await;
                    if let Err(e) = video
                        .write_frame(Bytes::from_static(&[0u8; 64]), interval)
                        .await
                    {
                        debug!("Synthetic capture feeder stopping: {}", e);
                        break;
                    }
                }
            })
        };

        let start = CaptureStart {
            stream_id: stream_id.clone(),
            track: video.clone(),
        };
        *running = Some(Running {
            start: start.clone(),
            video,
            feeder,
        });
        info!("Started synthetic capture {}", stream_id);
        Ok(start)
    }

    async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().take() else {
            return false;
        };
        running.video.stop();
        running.feeder.abort();
        info!("Stopped synthetic capture {}", running.start.stream_id);
        true
    }

    fn status(&self) -> CaptureStatus {
        match self.running.lock().as_ref() {
            Some(running) if !running.video.is_stopped() => CaptureStatus {
                is_capturing: true,
                stream_id: Some(running.start.stream_id.clone()),
            },
            _ => CaptureStatus::default(),
        }
    }
}
