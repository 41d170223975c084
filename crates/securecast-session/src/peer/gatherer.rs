//! Bounded candidate gathering

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::{LinkEvent, PeerLink};
use crate::signaling::CandidateRecord;

/// A candidate listener attached to one link
///
/// Attach before creating the local descriptor so that no early candidate
/// is missed, then [`finish`](Self::finish) once the descriptor exists. The
/// listener is dropped when `finish` returns.
pub struct Gathering {
    events: broadcast::Receiver<LinkEvent>,
    collected: Vec<CandidateRecord>,
}

impl Gathering {
    pub fn attach(link: &dyn PeerLink) -> Self {
        Self {
            events: link.subscribe(),
            collected: Vec::new(),
        }
    }

    /// Collect until gathering completes or `timeout` elapses
    ///
    /// Partial results on timeout; never an error.
    pub async fn finish(mut self, timeout: Duration) -> Vec<CandidateRecord> {
        let deadline = Instant::now() + timeout;

        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Err(_) => {
                    debug!(
                        "Candidate gathering timed out after {:?} with {} candidates",
                        timeout,
                        self.collected.len()
                    );
                    break;
                }
                Ok(Ok(LinkEvent::Candidate(candidate))) => self.collected.push(candidate),
                Ok(Ok(LinkEvent::GatheringComplete)) => {
                    debug!("Candidate gathering complete: {} candidates", self.collected.len());
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!("Candidate listener lagged, {} events skipped", skipped);
                }
                Ok(Err(RecvError::Closed)) => break,
            }
        }

        self.collected
    }
}

/// One-shot gathering on a link whose gathering is about to start
pub async fn gather(link: &dyn PeerLink, timeout: Duration) -> Vec<CandidateRecord> {
    Gathering::attach(link).finish(timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionFactory, GatheringMode, MemoryNetwork, MemoryOptions};

    #[tokio::test]
    async fn test_resolves_on_completion() {
        let network = MemoryNetwork::with_options(MemoryOptions {
            candidates: 3,
            ..Default::default()
        });
        let link = network.create().await.unwrap();
        let gathering = Gathering::attach(link.as_ref());
        link.create_offer().await.unwrap();

        let started = std::time::Instant::now();
        let candidates = gathering.finish(Duration::from_secs(5)).await;
        assert_eq!(candidates.len(), 3);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_partial_results_on_timeout() {
        let network = MemoryNetwork::with_options(MemoryOptions {
            candidates: 10,
            candidate_interval: Duration::from_millis(40),
            gathering: GatheringMode::Never,
            ..Default::default()
        });
        let link = network.create().await.unwrap();
        let gathering = Gathering::attach(link.as_ref());
        link.create_offer().await.unwrap();

        let timeout = Duration::from_millis(150);
        let started = std::time::Instant::now();
        let candidates = gathering.finish(timeout).await;
        let elapsed = started.elapsed();

        assert!(!candidates.is_empty());
        assert!(candidates.len() < 10);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_no_candidates_is_not_an_error() {
        let network = MemoryNetwork::with_options(MemoryOptions {
            candidates: 0,
            gathering: GatheringMode::Never,
            ..Default::default()
        });
        let link = network.create().await.unwrap();
        link.create_offer().await.unwrap();
        let candidates = gather(link.as_ref(), Duration::from_millis(100)).await;
        assert!(candidates.is_empty());
    }
}
