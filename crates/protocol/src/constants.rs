use serde::{Deserialize, Serialize};

/// Envelope schema version carried in every frame.
pub const PROTOCOL_VERSION: u32 = 1;

/// The only envelope `type` the device channel speaks.
pub const ENVELOPE_TYPE_EVENT: &str = "event";

/// Channel identifier used when an account does not set one.
pub const DEFAULT_CHANNEL_ID: &str = "openclaw-connect";

/// Configuration section name used by the host application.
pub const PLUGIN_ID: &str = "sensusai_chat";

/// Path appended to an endpoint that has none.
pub const DEVICE_CONNECT_PATH: &str = "/ws/device";

/// Health-check path derived from the endpoint host.
pub const HEALTH_PATH: &str = "/healthz";

/// Normal closure, sent on explicit shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close frame carried no status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Closed without a close frame (reset, stream end, read error).
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Policy violation.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Internal error, self-issued when a keepalive ping cannot be written.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Self-issued by the idle check.
pub const CLOSE_IDLE_TIMEOUT: u16 = 4000;

/// Close codes the server uses to reject credentials or authorization.
pub const UNAUTHORIZED_CLOSE_CODES: [u16; 5] = [CLOSE_POLICY_VIOLATION, 4001, 4003, 4401, 4403];

/// Close reason paired with [`CLOSE_NORMAL`].
pub const REASON_SHUTDOWN: &str = "shutdown";
/// Close reason paired with [`CLOSE_IDLE_TIMEOUT`].
pub const REASON_IDLE_TIMEOUT: &str = "idle timeout";
/// Close reason paired with [`CLOSE_INTERNAL_ERROR`].
pub const REASON_PING_FAILED: &str = "ping failed";

/// Application-level event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    // Cloud to device
    #[serde(rename = "message.send")]
    MessageSend,

    // Device to cloud
    #[serde(rename = "message.recv")]
    MessageRecv,
    #[serde(rename = "message.delta")]
    MessageDelta,
    #[serde(rename = "connection.state")]
    ConnectionState,
    #[serde(rename = "presence")]
    Presence,
    #[serde(rename = "ack")]
    Ack,

    /// Forward compatibility: unknown event names deserialize here.
    #[serde(other)]
    Unknown,
}
