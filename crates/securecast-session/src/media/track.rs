//! Outbound media tracks

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::{Error, Result};

/// A local track that can be attached to peer sessions
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;

    fn stream_id(&self) -> &str;

    fn kind(&self) -> &str {
        "video"
    }

    /// Stop producing media; idempotent
    fn stop(&self);

    fn is_stopped(&self) -> bool;

    /// The webrtc-rs track backing this one, if any
    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

/// VP8 video track fed with already encoded frames
///
/// Screen capture backends push encoded frames through
/// [`write_frame`](Self::write_frame); webrtc-rs handles packetization.
pub struct LocalVideoTrack {
    track: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
    frames_written: AtomicU64,
}

impl LocalVideoTrack {
    pub fn new(track_id: &str, stream_id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            track_id.to_owned(),
            stream_id.to_owned(),
        ));

        Self {
            track,
            stopped: AtomicBool::new(false),
            frames_written: AtomicU64::new(0),
        }
    }

    /// Write one encoded frame
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::MediaTrackError(format!(
                "track {} is stopped",
                self.id()
            )));
        }

        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };

        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to write sample: {}", e)))?;

        self.frames_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }
}

impl MediaTrack for LocalVideoTrack {
    fn id(&self) -> &str {
        self.track.id()
    }

    fn stream_id(&self) -> &str {
        self.track.stream_id()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(self.track.clone())
    }
}

impl std::fmt::Debug for LocalVideoTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalVideoTrack")
            .field("id", &self.id())
            .field("stream_id", &self.stream_id())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
