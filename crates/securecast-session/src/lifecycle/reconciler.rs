//! Keeping outbound sharing visible while the application is backgrounded
//!
//! Going to the background never closes or pauses a session. The reconciler
//! only reports what is still being shared, and on return to the foreground
//! compares the open sessions with what it saw before.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::media::MediaNegotiator;
use crate::peer::PeerRegistry;
use crate::session::SessionMachine;

const STATUS_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppPhase {
    Foreground,
    Background,
}

/// Record for a persistent "sharing active" notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharingStatus {
    pub count: usize,
    pub peer_names: Vec<String>,
}

impl SharingStatus {
    /// Human readable summary, e.g. "Sharing with 2 devices: Laptop, Phone"
    pub fn message(&self) -> String {
        format!(
            "Sharing with {} device{}: {}",
            self.count,
            if self.count == 1 { "" } else { "s" },
            self.peer_names.join(", ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedDevice {
    pub peer_id: String,
    pub name: String,
    pub duration_secs: u64,
}

/// Snapshot of outbound sharing for status displays
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareStatus {
    pub is_active: bool,
    pub share_count: usize,
    pub devices: Vec<SharedDevice>,
    /// Sum of every device's sharing time
    pub total_duration_secs: u64,
}

pub struct BackgroundReconciler {
    registry: Arc<PeerRegistry>,
    negotiator: Arc<MediaNegotiator>,
    status: broadcast::Sender<SharingStatus>,
    known: Mutex<BTreeSet<String>>,
    last_status: Mutex<Option<SharingStatus>>,
    phase: Mutex<AppPhase>,
}

impl BackgroundReconciler {
    pub fn new(registry: Arc<PeerRegistry>, negotiator: Arc<MediaNegotiator>) -> Self {
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            registry,
            negotiator,
            status,
            known: Mutex::new(BTreeSet::new()),
            last_status: Mutex::new(None),
            phase: Mutex::new(AppPhase::Foreground),
        }
    }

    pub fn for_machine(machine: &SessionMachine) -> Self {
        Self::new(machine.registry().clone(), machine.negotiator().clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SharingStatus> {
        self.status.subscribe()
    }

    pub fn phase(&self) -> AppPhase {
        *self.phase.lock()
    }

    /// React to the application changing phase
    ///
    /// Returns the status record that was published, if any.
    pub async fn on_transition(&self, phase: AppPhase) -> Option<SharingStatus> {
        *self.phase.lock() = phase;
        match phase {
            AppPhase::Background => self.enter_background().await,
            AppPhase::Foreground => self.enter_foreground().await,
        }
    }

    async fn enter_background(&self) -> Option<SharingStatus> {
        let open = self.open_ids().await;
        *self.known.lock() = open;

        let status = self.sharing_status().await;
        if status.count == 0 {
            debug!("Backgrounded with nothing shared");
            *self.last_status.lock() = None;
            return None;
        }

        info!("Backgrounded while sharing: {}", status.message());
        *self.last_status.lock() = Some(status.clone());
        self.publish(status.clone());
        Some(status)
    }

    async fn enter_foreground(&self) -> Option<SharingStatus> {
        let reemitted = self.last_status.lock().take();
        if let Some(status) = &reemitted {
            self.publish(status.clone());
        }

        let open = self.open_ids().await;
        let known = std::mem::replace(&mut *self.known.lock(), open.clone());
        for gone in known.difference(&open) {
            warn!("Session with {} ended while in the background", gone);
        }
        for new in open.difference(&known) {
            info!("Session with {} opened while in the background", new);
        }

        for device in self.share_status().await.devices {
            debug!("Still sharing with {} for {}s", device.name, device.duration_secs);
        }
        reemitted
    }

    /// Re-publish the status while backgrounded, after sharing changed
    pub async fn refresh(&self) -> Option<SharingStatus> {
        if self.phase() != AppPhase::Background {
            return None;
        }
        let status = self.sharing_status().await;
        *self.last_status.lock() = (status.count > 0).then(|| status.clone());
        self.publish(status.clone());
        Some(status)
    }

    /// Detach every outbound track and close every session
    ///
    /// Returns the number of sessions closed.
    pub async fn stop_all(&self) -> usize {
        for session in self.negotiator.active_outbound().await {
            let peer_id = session.peer_id();
            if let Err(e) = self.negotiator.detach(&peer_id).await {
                warn!("Failed to stop sharing with {}: {}", peer_id, e);
            }
        }

        let closed = self.registry.close_all().await.len();
        self.known.lock().clear();
        *self.last_status.lock() = None;
        info!("Stopped all sharing, closed {} sessions", closed);
        closed
    }

    pub async fn share_status(&self) -> ShareStatus {
        let devices: Vec<SharedDevice> = self
            .negotiator
            .active_outbound()
            .await
            .into_iter()
            .filter_map(|session| {
                let outbound = session.outbound()?;
                Some(SharedDevice {
                    peer_id: session.peer_id(),
                    name: session.display_name(),
                    duration_secs: outbound.attached_at.elapsed().as_secs(),
                })
            })
            .collect();

        ShareStatus {
            is_active: !devices.is_empty(),
            share_count: devices.len(),
            total_duration_secs: devices.iter().map(|d| d.duration_secs).sum(),
            devices,
        }
    }

    async fn sharing_status(&self) -> SharingStatus {
        let mut peer_names: Vec<String> = self
            .negotiator
            .active_outbound()
            .await
            .iter()
            .map(|session| session.display_name())
            .collect();
        peer_names.sort();

        SharingStatus {
            count: peer_names.len(),
            peer_names,
        }
    }

    async fn open_ids(&self) -> BTreeSet<String> {
        self.registry
            .list_open()
            .await
            .iter()
            .map(|session| session.peer_id())
            .collect()
    }

    fn publish(&self, status: SharingStatus) {
        let _ = self.status.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::DataChannelBus;
    use crate::events::EventHub;

    fn reconciler() -> BackgroundReconciler {
        let registry = Arc::new(PeerRegistry::new(4).unwrap());
        let bus = Arc::new(DataChannelBus::new(registry.clone(), 16));
        let negotiator = MediaNegotiator::new(registry.clone(), bus, EventHub::new(16));
        BackgroundReconciler::new(registry, negotiator)
    }

    #[test]
    fn test_status_message() {
        let one = SharingStatus {
            count: 1,
            peer_names: vec!["Laptop".to_string()],
        };
        assert_eq!(one.message(), "Sharing with 1 device: Laptop");

        let two = SharingStatus {
            count: 2,
            peer_names: vec!["Laptop".to_string(), "Phone".to_string()],
        };
        assert_eq!(two.message(), "Sharing with 2 devices: Laptop, Phone");
    }

    #[tokio::test]
    async fn test_nothing_shared_emits_nothing() {
        let reconciler = reconciler();
        let mut status = reconciler.subscribe();

        assert!(reconciler.on_transition(AppPhase::Background).await.is_none());
        assert_eq!(reconciler.phase(), AppPhase::Background);
        assert!(reconciler.on_transition(AppPhase::Foreground).await.is_none());
        assert!(status.try_recv().is_err());
        assert_eq!(reconciler.share_status().await, ShareStatus::default());
    }

    #[tokio::test]
    async fn test_refresh_only_in_background() {
        let reconciler = reconciler();
        assert!(reconciler.refresh().await.is_none());
        reconciler.on_transition(AppPhase::Background).await;
        assert_eq!(reconciler.refresh().await.map(|s| s.count), Some(0));
    }

    #[tokio::test]
    async fn test_stop_all_on_empty_registry() {
        let reconciler = reconciler();
        assert_eq!(reconciler.stop_all().await, 0);
    }
}
