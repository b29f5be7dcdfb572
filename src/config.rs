//! Runtime configuration for channel components.
//!
//! Plain serde-deserializable structs with defaults, so hosts can embed
//! them in whatever configuration surface they already load.

use std::time::Duration;

use serde::Deserialize;

/// Default delay before a reconnect attempt after an endpoint death.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Consumer proxy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Milliseconds to wait after a death signal before the single
    /// reconnect attempt.
    pub reconnect_delay_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

impl ProxyConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Producer controller configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Drop a sent value when it equals the previous one.
    pub dedup_last: bool,
}
