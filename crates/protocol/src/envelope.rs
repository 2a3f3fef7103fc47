use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::constants::{ENVELOPE_TYPE_EVENT, EventName, PROTOCOL_VERSION};

/// Envelope for all device-channel communication.
///
/// Outbound envelopes always carry every field. Inbound frames are parsed
/// leniently: only `type` and `name` are required, everything else falls back
/// to its default (including explicit `null`s).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: EventName,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ts: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub device_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub msg_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Envelope {
    /// Creates an outbound event envelope.
    ///
    /// A fresh UUID is used when `msg_id` is `None` or empty.
    pub fn event<T: Serialize>(
        name: EventName,
        device_id: impl Into<String>,
        msg_id: Option<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let msg_id = msg_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(Self {
            v: PROTOCOL_VERSION,
            kind: ENVELOPE_TYPE_EVENT.to_string(),
            name,
            ts: now_millis(),
            device_id: device_id.into(),
            session_id: None,
            msg_id,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Parses a raw text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serializes the envelope into a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Returns `true` for `type: "event"` envelopes.
    pub fn is_event(&self) -> bool {
        self.kind == ENVELOPE_TYPE_EVENT
    }

    /// The message id, if the sender provided a non-empty one.
    pub fn msg_id(&self) -> Option<&str> {
        (!self.msg_id.is_empty()).then_some(self.msg_id.as_str())
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}
