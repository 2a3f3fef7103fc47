//! Public types for connection runtimes.

use serde::Serialize;

use crate::classifier::DisconnectReason;

/// Lifecycle state of one account's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not started, explicitly closed, or given up after a fatal disconnect.
    #[default]
    Stopped,
    /// Socket handshake in progress.
    Connecting,
    /// Socket open and timers armed.
    Connected,
    /// Waiting for the reconnect timer.
    Reconnecting,
}

/// Events emitted by runtimes through the registry's event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// The runtime moved to a new state.
    StateChanged {
        account_id: String,
        state: ConnectionState,
    },
    /// A reconnect has been scheduled.
    Reconnecting {
        account_id: String,
        attempt: u32,
        delay_ms: u64,
        reason: DisconnectReason,
    },
    /// The runtime gave up; operator action is needed.
    Fatal { account_id: String, error: String },
}

/// Point-in-time view of a runtime. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSnapshot {
    pub account_id: String,
    pub state: ConnectionState,
    pub running: bool,
    pub queue_size: usize,
    pub dropped_count: u64,
    pub reconnect_attempt: u32,
    pub last_start_at: Option<i64>,
    pub last_stop_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_inbound_at: Option<i64>,
    pub last_outbound_at: Option<i64>,
}

/// Status published by the supervisory loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    pub account_id: String,
    pub enabled: bool,
    pub configured: bool,
    pub running: bool,
    pub connected: bool,
    pub state: ConnectionState,
    pub queue_size: usize,
    pub dropped_count: u64,
    pub reconnect_attempt: u32,
    pub last_start_at: Option<i64>,
    pub last_stop_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_inbound_at: Option<i64>,
    pub last_outbound_at: Option<i64>,
}

impl AccountStatus {
    /// Status for an account that has no runtime.
    pub fn idle(
        account_id: impl Into<String>,
        enabled: bool,
        configured: bool,
        last_error: Option<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            enabled,
            configured,
            running: false,
            connected: false,
            state: ConnectionState::Stopped,
            queue_size: 0,
            dropped_count: 0,
            reconnect_attempt: 0,
            last_start_at: None,
            last_stop_at: None,
            last_error,
            last_inbound_at: None,
            last_outbound_at: None,
        }
    }

    /// Status projected from a runtime snapshot.
    pub fn from_snapshot(enabled: bool, configured: bool, snapshot: RuntimeSnapshot) -> Self {
        Self {
            account_id: snapshot.account_id,
            enabled,
            configured,
            running: snapshot.running,
            connected: snapshot.state == ConnectionState::Connected,
            state: snapshot.state,
            queue_size: snapshot.queue_size,
            dropped_count: snapshot.dropped_count,
            reconnect_attempt: snapshot.reconnect_attempt,
            last_start_at: snapshot.last_start_at,
            last_stop_at: snapshot.last_stop_at,
            last_error: snapshot.last_error,
            last_inbound_at: snapshot.last_inbound_at,
            last_outbound_at: snapshot.last_outbound_at,
        }
    }
}
