//! Coordinator configuration

use crate::identity::PeerId;
use crate::types::PeerStatus;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid JSON for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Upper bound on a single offer retry delay
const MAX_OFFER_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Negotiation coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Period of the connection-quality sampler
    pub stats_interval_ms: u64,
    /// ICE servers handed to every media transport
    pub ice_servers: Vec<IceServer>,
    /// ICE restarts allowed per peer before the connection is reported lost
    pub max_ice_restarts: u32,
    /// Retries of a failed offer before giving up until the next trigger
    pub max_offer_retries: u32,
    /// Delay before the first offer retry, doubled on each further retry
    pub offer_retry_base_ms: u64,
    /// Capacity of the presentation event channel
    pub event_channel_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stats_interval_ms: 3000,
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::stun("stun:stun2.l.google.com:19302"),
            ],
            max_ice_restarts: 5,
            max_offer_retries: 3,
            offer_retry_base_ms: 500,
            event_channel_capacity: 256,
        }
    }
}

impl CoordinatorConfig {
    /// Load and validate a JSON config file
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error naming the first out-of-range field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stats_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "stats_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err(ConfigError::Invalid(
                "every ice server needs at least one url".to_string(),
            ));
        }
        Ok(())
    }

    /// Sampler period
    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Delay before offer retry number `attempt` (1-based)
    #[must_use]
    pub fn offer_retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.offer_retry_base_ms.saturating_mul(factor))
            .min(MAX_OFFER_RETRY_DELAY)
    }
}

/// The local participant joining a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalParticipant {
    /// Room code the relay scopes messages by
    pub room_code: String,
    /// Local peer id
    pub peer_id: PeerId,
    /// Display name announced on join
    pub display_name: String,
    /// Whether the local participant hosts the room
    pub is_host: bool,
    /// Initial local flags
    pub status: PeerStatus,
}

impl LocalParticipant {
    /// Participant with a random peer id and conservative flags
    pub fn new(room_code: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            room_code: room_code.into(),
            peer_id: PeerId::random(),
            display_name: display_name.into(),
            is_host: false,
            status: PeerStatus::conservative(),
        }
    }

    /// Use a fixed peer id
    #[must_use]
    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = peer_id;
        self
    }

    /// Mark as host
    #[must_use]
    pub fn as_host(mut self) -> Self {
        self.is_host = true;
        self
    }
}
