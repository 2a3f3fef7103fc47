//! Raw configuration → [`AccountDescriptor`].
//!
//! Accepted shapes, first match wins:
//!
//! 1. legacy single account (`cloudUrl`/`deviceId`/`deviceSecret` at the top level)
//! 2. top-level `accounts` map
//! 3. `channels.sensusai_chat`, either a single account or an `accounts` map
//! 4. `channels.openclaw-connect`, same rules

use serde_json::{Map, Value};
use tracing::debug;

use cloudlink_protocol::constants::{DEFAULT_CHANNEL_ID, PLUGIN_ID};

use crate::descriptor::{
    AccountDescriptor, DEFAULT_CONNECT_PROBE_TIMEOUT_MS, DEFAULT_HEARTBEAT_MS,
    DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_KEEPALIVE_PING_MS, DEFAULT_MAX_QUEUE_SIZE,
    DEFAULT_RECONNECT_FACTOR, DEFAULT_RECONNECT_INITIAL_MS, DEFAULT_RECONNECT_JITTER,
    DEFAULT_RECONNECT_MAX_MS, DEFAULT_RECONNECT_MS, MIN_CONNECT_PROBE_TIMEOUT_MS,
    MIN_IDLE_TIMEOUT_MS, MIN_KEEPALIVE_PING_MS, MIN_MAX_QUEUE_SIZE, is_configured,
};

/// Account id assigned to single-account shapes.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

enum Accounts<'a> {
    None,
    Single(&'a Value),
    Map(&'a Map<String, Value>),
}

impl<'a> Accounts<'a> {
    fn get(&self, account_id: &str) -> Option<&'a Value> {
        match self {
            Accounts::None => None,
            Accounts::Single(v) => (account_id == DEFAULT_ACCOUNT_ID).then_some(*v),
            Accounts::Map(m) => m.get(account_id),
        }
    }

    fn ids(&self) -> Vec<String> {
        match self {
            Accounts::None => Vec::new(),
            Accounts::Single(_) => vec![DEFAULT_ACCOUNT_ID.to_string()],
            Accounts::Map(m) => m.keys().cloned().collect(),
        }
    }
}

/// Truthiness of an optional JSON value: absent, `null`, `false`, `0` and
/// `""` are falsy.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

fn map_of(value: Option<&Value>) -> Accounts<'_> {
    match value.and_then(Value::as_object) {
        Some(m) => Accounts::Map(m),
        None => Accounts::None,
    }
}

fn channel_section<'a>(config: &'a Value, key: &str) -> Option<Accounts<'a>> {
    let section = config.get("channels")?.get(key)?;
    if !truthy(Some(section)) {
        return None;
    }
    if truthy(section.get("accounts")) {
        Some(map_of(section.get("accounts")))
    } else {
        Some(Accounts::Single(section))
    }
}

fn accounts(config: &Value) -> Accounts<'_> {
    if !config.is_object() {
        return Accounts::None;
    }
    let legacy = ["cloudUrl", "deviceId", "deviceSecret"]
        .iter()
        .any(|key| truthy(config.get(*key)));
    if legacy {
        return Accounts::Single(config);
    }
    if truthy(config.get("accounts")) {
        return map_of(config.get("accounts"));
    }
    channel_section(config, PLUGIN_ID)
        .or_else(|| channel_section(config, DEFAULT_CHANNEL_ID))
        .unwrap_or(Accounts::None)
}

/// Lists the account ids present in the configuration.
pub fn list_account_ids(config: &Value) -> Vec<String> {
    accounts(config).ids()
}

/// Resolves one account, applying defaults and floors.
///
/// Returns `None` when the account is absent (or its entry is falsy).
pub fn resolve_account(config: &Value, account_id: &str) -> Option<AccountDescriptor> {
    let entry = accounts(config).get(account_id)?;
    if !truthy(Some(entry)) {
        return None;
    }

    let endpoint = string_field(entry, "cloudUrl");
    let device_id = string_field(entry, "deviceId");
    let device_secret = string_field(entry, "deviceSecret");
    let channel_id = match string_field(entry, "channelId") {
        s if s.is_empty() => DEFAULT_CHANNEL_ID.to_string(),
        s => s,
    };

    let reconnect_ms = millis(pick_number(entry, "reconnectMs", DEFAULT_RECONNECT_MS as f64));
    let initial_fallback = if reconnect_ms > 0 {
        reconnect_ms
    } else {
        DEFAULT_RECONNECT_INITIAL_MS
    };

    let heartbeat_ms = match millis(pick_number(entry, "heartbeatMs", DEFAULT_HEARTBEAT_MS as f64)) {
        0 => DEFAULT_HEARTBEAT_MS,
        ms => ms,
    };

    Some(AccountDescriptor {
        id: account_id.to_string(),
        enabled: entry.get("enabled") != Some(&Value::Bool(false)),
        configured: is_configured(&endpoint, &device_id, &device_secret),
        endpoint,
        channel_id,
        device_id,
        device_secret,
        heartbeat_ms,
        reconnect_ms,
        reconnect_initial_ms: millis(pick_number(
            entry,
            "reconnectInitialMs",
            initial_fallback as f64,
        )),
        reconnect_max_ms: millis(pick_number(
            entry,
            "reconnectMaxMs",
            DEFAULT_RECONNECT_MAX_MS as f64,
        )),
        reconnect_factor: pick_number(entry, "reconnectFactor", DEFAULT_RECONNECT_FACTOR).max(1.0),
        reconnect_jitter: pick_number(entry, "reconnectJitter", DEFAULT_RECONNECT_JITTER)
            .clamp(0.0, 1.0),
        max_queue_size: (millis(pick_number(
            entry,
            "maxQueueSize",
            DEFAULT_MAX_QUEUE_SIZE as f64,
        )) as usize)
            .max(MIN_MAX_QUEUE_SIZE),
        idle_timeout_ms: millis(pick_number(
            entry,
            "idleTimeoutMs",
            DEFAULT_IDLE_TIMEOUT_MS as f64,
        ))
        .max(MIN_IDLE_TIMEOUT_MS),
        connect_probe_timeout_ms: millis(pick_number(
            entry,
            "connectProbeTimeoutMs",
            DEFAULT_CONNECT_PROBE_TIMEOUT_MS as f64,
        ))
        .max(MIN_CONNECT_PROBE_TIMEOUT_MS),
        keepalive_ping_ms: millis(pick_number(
            entry,
            "wsPingMs",
            DEFAULT_KEEPALIVE_PING_MS as f64,
        ))
        .max(MIN_KEEPALIVE_PING_MS),
    })
}

fn string_field(entry: &Value, key: &str) -> String {
    entry
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Reads a finite number from a JSON number or numeric string.
fn pick_number(entry: &Value, key: &str, fallback: f64) -> f64 {
    let parsed = match entry.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n.is_finite() => n,
        Some(_) | None => {
            if entry.get(key).is_some_and(|v| !v.is_null()) {
                debug!(field = key, fallback, "malformed numeric field, using default");
            }
            fallback
        }
    }
}

/// Floors to whole milliseconds; negatives become zero.
fn millis(value: f64) -> u64 {
    value.floor().max(0.0) as u64
}
