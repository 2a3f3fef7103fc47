//! Resolved, immutable account parameters.

use std::fmt;
use std::time::Duration;

use cloudlink_protocol::constants::DEFAULT_CHANNEL_ID;

pub const DEFAULT_HEARTBEAT_MS: u64 = 20_000;
pub const DEFAULT_RECONNECT_MS: u64 = 2_000;
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 2_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_FACTOR: f64 = 1.8;
pub const DEFAULT_RECONNECT_JITTER: f64 = 0.25;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 500;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_CONNECT_PROBE_TIMEOUT_MS: u64 = 2_500;
pub const DEFAULT_KEEPALIVE_PING_MS: u64 = 25_000;

pub const MIN_MAX_QUEUE_SIZE: usize = 1;
pub const MIN_IDLE_TIMEOUT_MS: u64 = 30_000;
pub const MIN_CONNECT_PROBE_TIMEOUT_MS: u64 = 500;
pub const MIN_KEEPALIVE_PING_MS: u64 = 10_000;

/// Upper bound of the idle-check period.
pub const MAX_IDLE_CHECK_MS: u64 = 30_000;

/// Identity and tuning parameters for one logical connection.
///
/// Re-resolved from configuration on every (re)start; never mutated in place.
#[derive(Clone, PartialEq)]
pub struct AccountDescriptor {
    pub id: String,
    pub enabled: bool,
    /// `true` iff endpoint, device id and device secret are all non-empty.
    pub configured: bool,
    pub endpoint: String,
    pub channel_id: String,
    pub device_id: String,
    pub device_secret: String,
    pub heartbeat_ms: u64,
    /// Legacy single reconnect delay; seeds `reconnect_initial_ms`.
    pub reconnect_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_factor: f64,
    pub reconnect_jitter: f64,
    pub max_queue_size: usize,
    pub idle_timeout_ms: u64,
    pub connect_probe_timeout_ms: u64,
    pub keepalive_ping_ms: u64,
}

impl AccountDescriptor {
    /// Creates an enabled account with default tuning.
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        device_id: impl Into<String>,
        device_secret: impl Into<String>,
    ) -> Self {
        let endpoint = endpoint.into();
        let device_id = device_id.into();
        let device_secret = device_secret.into();
        Self {
            id: id.into(),
            enabled: true,
            configured: is_configured(&endpoint, &device_id, &device_secret),
            endpoint,
            channel_id: DEFAULT_CHANNEL_ID.to_string(),
            device_id,
            device_secret,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            reconnect_ms: DEFAULT_RECONNECT_MS,
            reconnect_initial_ms: DEFAULT_RECONNECT_INITIAL_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
            reconnect_factor: DEFAULT_RECONNECT_FACTOR,
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            connect_probe_timeout_ms: DEFAULT_CONNECT_PROBE_TIMEOUT_MS,
            keepalive_ping_ms: DEFAULT_KEEPALIVE_PING_MS,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_ping_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Period of the idle check: the idle timeout, capped at 30 s.
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.min(MAX_IDLE_CHECK_MS))
    }

    pub fn connect_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_probe_timeout_ms)
    }
}

pub(crate) fn is_configured(endpoint: &str, device_id: &str, device_secret: &str) -> bool {
    !endpoint.is_empty() && !device_id.is_empty() && !device_secret.is_empty()
}

impl fmt::Debug for AccountDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secret = if self.device_secret.is_empty() {
            ""
        } else {
            "<redacted>"
        };
        f.debug_struct("AccountDescriptor")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("configured", &self.configured)
            .field("endpoint", &self.endpoint)
            .field("channel_id", &self.channel_id)
            .field("device_id", &self.device_id)
            .field("device_secret", &secret)
            .field("heartbeat_ms", &self.heartbeat_ms)
            .field("reconnect_initial_ms", &self.reconnect_initial_ms)
            .field("reconnect_max_ms", &self.reconnect_max_ms)
            .field("reconnect_factor", &self.reconnect_factor)
            .field("reconnect_jitter", &self.reconnect_jitter)
            .field("max_queue_size", &self.max_queue_size)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .field("connect_probe_timeout_ms", &self.connect_probe_timeout_ms)
            .field("keepalive_ping_ms", &self.keepalive_ping_ms)
            .finish()
    }
}
