//! Connector configuration.
//!
//! The embedding host constructs (or deserializes) a [`LinkConfig`] and hands
//! it to the connector. Durations are stored as integer fields so the struct
//! round-trips through TOML/JSON config files cleanly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable configuration for one connector instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkConfig {
    /// WebSocket endpoint for the signaling channel.
    pub signaling_url: String,

    /// HTTP endpoint for the media offer/answer exchange.
    pub media_endpoint: String,

    /// STUN/TURN server URLs for ICE. Empty is valid (host candidates only).
    #[serde(default)]
    pub ice_servers: Vec<String>,

    /// Bound applied to each connection step individually: the channel open
    /// handshake, ICE gathering, and the media offer/answer HTTP exchange.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Bound on waiting for the server-issued session identifier.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    /// Reconnect automatically after unexpected channel loss.
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Fixed delay between reconnect attempts.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Consecutive reconnect attempts before giving up. The counter resets
    /// on any successful open.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Grace period between closing the old channel and opening the new one
    /// during a thread switch.
    #[serde(default = "default_switch_grace_ms")]
    pub switch_grace_ms: u64,

    /// Extra payload merged into the `client-config` frame sent once per
    /// fresh (non-thread-scoped) connection.
    #[serde(default)]
    pub client_config: Option<serde_json::Value>,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_session_timeout_secs() -> u64 {
    10
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_interval_ms() -> u64 {
    3_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_switch_grace_ms() -> u64 {
    250
}

impl LinkConfig {
    pub fn new(signaling_url: impl Into<String>, media_endpoint: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            media_endpoint: media_endpoint.into(),
            ice_servers: Vec::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            session_timeout_secs: default_session_timeout_secs(),
            auto_reconnect: default_auto_reconnect(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            switch_grace_ms: default_switch_grace_ms(),
            client_config: None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn switch_grace(&self) -> Duration {
        Duration::from_millis(self.switch_grace_ms)
    }
}
