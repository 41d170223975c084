//! Peer session registry

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::session::PeerSession;
use crate::session::state::SessionState;
use crate::{Error, Result};

/// Maps device identities to their sessions
///
/// The registry is the single point of mutation for the session set. The
/// lock is never held while a connection is being closed.
pub struct PeerRegistry {
    /// Map of peer_id to PeerSession
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,

    /// Maximum number of sessions allowed
    max_sessions: usize,
}

impl PeerRegistry {
    /// Create a new registry
    ///
    /// # Arguments
    ///
    /// * `max_sessions` - Maximum number of simultaneous sessions (1-16)
    pub fn new(max_sessions: usize) -> Result<Self> {
        if max_sessions == 0 || max_sessions > 16 {
            return Err(Error::InvalidConfig(format!(
                "max_sessions must be in range 1-16, got {}",
                max_sessions
            )));
        }

        Ok(Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        })
    }

    /// Register a session under `peer_id`
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the id is taken, `SessionLimit` at capacity.
    pub async fn register(&self, peer_id: &str, session: Arc<PeerSession>) -> Result<()> {
        let mut sessions = self.sessions.write().await;

        if sessions.contains_key(peer_id) {
            return Err(Error::AlreadyExists(peer_id.to_string()));
        }

        if sessions.len() >= self.max_sessions {
            return Err(Error::SessionLimit(self.max_sessions));
        }

        info!("Registering session for {}", peer_id);
        sessions.insert(peer_id.to_string(), session);
        Ok(())
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().await.get(peer_id).cloned()
    }

    /// Move a session from `old` to `new`
    ///
    /// Fails with `AlreadyExists` when `new` is taken, leaving `old` in place.
    pub async fn rekey(&self, old: &str, new: &str) -> Result<()> {
        if old == new {
            return Ok(());
        }

        let mut sessions = self.sessions.write().await;

        if sessions.contains_key(new) {
            return Err(Error::AlreadyExists(new.to_string()));
        }

        let session = sessions
            .remove(old)
            .ok_or_else(|| Error::NoSuchSession(old.to_string()))?;
        session.set_peer_id(new);
        sessions.insert(new.to_string(), session);

        debug!("Re-keyed session {} -> {}", old, new);
        Ok(())
    }

    /// Remove and close a session; idempotent
    pub async fn remove(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        let removed = self.sessions.write().await.remove(peer_id);

        if let Some(session) = &removed {
            info!("Removing session for {}", peer_id);
            session.close().await;
        }

        removed
    }

    /// Remove `peer_id` only if it still maps to `session`
    ///
    /// `session` is closed either way.
    pub async fn remove_if_same(&self, peer_id: &str, session: &Arc<PeerSession>) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(peer_id) {
                Some(current) if Arc::ptr_eq(current, session) => sessions.remove(peer_id),
                _ => None,
            }
        };

        match removed {
            Some(session) => {
                info!("Removing session for {}", peer_id);
                session.close().await;
                true
            }
            None => {
                session.close().await;
                false
            }
        }
    }

    /// Sessions whose channel is open
    pub async fn list_open(&self) -> Vec<Arc<PeerSession>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.state() == SessionState::ChannelOpen)
            .cloned()
            .collect()
    }

    pub async fn list_all(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn contains(&self, peer_id: &str) -> bool {
        self.sessions.read().await.contains_key(peer_id)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Remove and close every session, returning them
    pub async fn close_all(&self) -> Vec<Arc<PeerSession>> {
        let drained: Vec<(String, Arc<PeerSession>)> =
            self.sessions.write().await.drain().collect();

        debug!("Closing {} sessions", drained.len());
        for (peer_id, session) in &drained {
            debug!("Closing session for {}", peer_id);
            session.close().await;
        }

        drained.into_iter().map(|(_, session)| session).collect()
    }
}
