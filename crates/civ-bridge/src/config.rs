//! Bridge configuration

use std::time::Duration;
use tracing::warn;

/// Exponential reconnect backoff
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Consecutive failures before giving up
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`, attempt counted from zero
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

/// Configuration for the bridge services
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Name of the channel the native process listens on
    pub pipe_name: String,
    /// Initial connection timeout
    pub connect_timeout: Duration,
    /// Interval between dials while the initial connection is pending
    pub connect_retry_interval: Duration,
    /// Reconnect backoff
    pub reconnect: ReconnectPolicy,
    /// Timeout for calls that do not name their own
    pub default_call_timeout: Duration,
    /// Maximum time a non-critical event waits before flush
    pub batch_window: Duration,
    /// Batch size that forces an immediate flush
    pub batch_size: usize,
    /// Exclusive upper bound on player ids
    pub max_players: u32,
    /// Name of the OS-visible manual pause lock
    pub pause_lock_name: String,
    /// Capacity of the push-event fan-out channel
    pub event_channel_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pipe_name: "civ-bridge".into(),
            connect_timeout: Duration::from_secs(5),
            connect_retry_interval: Duration::from_millis(500),
            reconnect: ReconnectPolicy::default(),
            default_call_timeout: Duration::from_secs(5),
            batch_window: Duration::from_millis(50),
            batch_size: 20,
            max_players: 64,
            pause_lock_name: "civ-bridge-paused".into(),
            event_channel_capacity: 256,
        }
    }
}

impl BridgeConfig {
    /// Defaults overlaid with `CIV_BRIDGE_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(name) = std::env::var("CIV_BRIDGE_PIPE") {
            config.pipe_name = name;
        }
        if let Ok(name) = std::env::var("CIV_BRIDGE_PAUSE_LOCK") {
            config.pause_lock_name = name;
        }
        if let Some(ms) = env_number("CIV_BRIDGE_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("CIV_BRIDGE_CALL_TIMEOUT_MS") {
            config.default_call_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_number("CIV_BRIDGE_MAX_RECONNECT") {
            config.reconnect.max_attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        }
        config
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}
