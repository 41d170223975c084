//! Configuration types for peer sessions

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration for a [`SessionMachine`](crate::SessionMachine)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// STUN server URLs (may be empty on a LAN)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Human-readable name announced to peers (derived from the device id if None)
    pub device_name: Option<String>,

    /// Candidate gathering bound in milliseconds (default: 3000, range: 100-30000)
    pub gather_timeout_ms: u64,

    /// Wait for the data channel after both descriptors are applied
    /// (default: 30000, range: 1000-300000)
    pub handshake_timeout_ms: u64,

    /// Relay endpoint for brokered signaling (ws:// or wss://)
    pub relay_url: Option<String>,

    /// Relay registration bound in milliseconds (default: 15000)
    pub relay_connect_timeout_ms: u64,

    /// Maximum concurrent sessions (default: 8, max: 16)
    pub max_sessions: usize,

    /// Label of the negotiated data channel (default: "messages")
    pub channel_label: String,

    /// Capacity of the event broadcast channels (default: 256)
    pub event_capacity: usize,

    /// Offer loopback interface candidates (useful for same-host testing)
    pub include_loopback_candidates: bool,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            device_name: None,
            gather_timeout_ms: 3000,
            handshake_timeout_ms: 30_000,
            relay_url: None,
            relay_connect_timeout_ms: 15_000,
            max_sessions: 8,
            channel_label: "messages".to_string(),
            event_capacity: 256,
            include_loopback_candidates: false,
        }
    }
}

impl SessionConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - a STUN url does not start with `stun:`/`stuns:`
    /// - a TURN url does not start with `turn:`/`turns:`
    /// - `gather_timeout_ms` is not in range 100-30000
    /// - `handshake_timeout_ms` is not in range 1000-300000
    /// - `relay_url` is set and is not a WebSocket URL
    /// - `max_sessions` is not in range 1-16
    /// - `channel_label` is empty or `event_capacity` is below 16
    pub fn validate(&self) -> Result<()> {
        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "stun server must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "turn server must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if !(100..=30_000).contains(&self.gather_timeout_ms) {
            return Err(Error::InvalidConfig(format!(
                "gather_timeout_ms must be in range 100-30000, got {}",
                self.gather_timeout_ms
            )));
        }

        if !(1_000..=300_000).contains(&self.handshake_timeout_ms) {
            return Err(Error::InvalidConfig(format!(
                "handshake_timeout_ms must be in range 1000-300000, got {}",
                self.handshake_timeout_ms
            )));
        }

        if let Some(url) = &self.relay_url {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(Error::InvalidConfig(format!(
                    "relay_url must start with ws:// or wss://, got {}",
                    url
                )));
            }
        }

        if self.relay_connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "relay_connect_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.max_sessions == 0 || self.max_sessions > 16 {
            return Err(Error::InvalidConfig(format!(
                "max_sessions must be in range 1-16, got {}",
                self.max_sessions
            )));
        }

        if self.channel_label.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "channel_label must not be empty".to_string(),
            ));
        }

        if self.event_capacity < 16 {
            return Err(Error::InvalidConfig(format!(
                "event_capacity must be at least 16, got {}",
                self.event_capacity
            )));
        }

        Ok(())
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SessionConfig = toml::from_str(text)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Configuration for two devices on the same network
    ///
    /// No STUN/TURN, loopback candidates enabled, shorter gathering.
    ///
    /// # Example
    ///
    /// ```
    /// use securecast_session::SessionConfig;
    ///
    /// let config = SessionConfig::lan_preset();
    /// assert!(config.stun_servers.is_empty());
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn lan_preset() -> Self {
        Self {
            stun_servers: Vec::new(),
            gather_timeout_ms: 1000,
            include_loopback_candidates: true,
            ..Default::default()
        }
    }

    /// Configuration for brokered signaling through a relay
    ///
    /// # Example
    ///
    /// ```
    /// use securecast_session::SessionConfig;
    ///
    /// let config = SessionConfig::relay_preset("ws://localhost:9090");
    /// assert_eq!(config.relay_url.as_deref(), Some("ws://localhost:9090"));
    /// ```
    pub fn relay_preset(relay_url: &str) -> Self {
        Self {
            relay_url: Some(relay_url.to_string()),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        }
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn relay_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_connect_timeout_ms)
    }
}
