use serde::{Deserialize, Deserializer, Serialize};

use crate::envelope::now_millis;

/// Content type of plain-text replies.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
/// Content type of media replies.
pub const CONTENT_TYPE_IMAGE: &str = "image";

/// Processing hint sent when an inbound message carries only text.
pub const PROCESSING_HINT_TEXT: &str = "Received, thinking...";
/// Processing hint sent when an inbound message carries attachments.
pub const PROCESSING_HINT_MEDIA: &str = "Attachment received, analyzing...";

// ---------------------------------------------------------------------------
// Cloud to device
// ---------------------------------------------------------------------------

/// Payload of an inbound `message.send`.
///
/// Every field is optional; list fields that are not arrays are treated as
/// empty rather than failing the whole payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageSendPayload {
    pub text: Option<String>,
    pub sender_id: Option<String>,
    pub from: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub media_urls: Vec<serde_json::Value>,
    #[serde(deserialize_with = "lenient_list")]
    pub attachments: Vec<serde_json::Value>,
}

fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Array(items) => Ok(items),
        _ => Ok(Vec::new()),
    }
}

/// Returns the download link of a raw attachment object.
///
/// Checks `getUrl`, `url`, then `mediaUrl`; empty strings are skipped.
pub fn attachment_link(attachment: &serde_json::Value) -> Option<&str> {
    ["getUrl", "url", "mediaUrl"]
        .iter()
        .filter_map(|key| attachment.get(*key).and_then(|v| v.as_str()))
        .find(|s| !s.is_empty())
}

impl MessageSendPayload {
    /// Trimmed message text (empty when absent).
    pub fn text(&self) -> &str {
        self.text.as_deref().map(str::trim).unwrap_or_default()
    }

    /// Whether the message carries at least one attachment object.
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Media URLs from `mediaUrls` followed by attachment links, with blanks
    /// removed and duplicates collapsed (first occurrence wins).
    pub fn media_urls(&self) -> Vec<String> {
        let direct = self.media_urls.iter().filter_map(|v| v.as_str());
        let linked = self.attachments.iter().filter_map(attachment_link);

        let mut out: Vec<String> = Vec::new();
        for url in direct.chain(linked) {
            if url.trim().is_empty() || out.iter().any(|u| u == url) {
                continue;
            }
            out.push(url.to_string());
        }
        out
    }

    /// Peer identity used for routing replies.
    pub fn peer_id<'a>(&'a self, session_id: Option<&'a str>, msg_id: Option<&'a str>) -> &'a str {
        [self.sender_id.as_deref(), self.from.as_deref(), session_id, msg_id]
            .into_iter()
            .flatten()
            .find(|s| !s.is_empty())
            .unwrap_or("app")
    }
}

// ---------------------------------------------------------------------------
// Device to cloud
// ---------------------------------------------------------------------------

/// Payload of an outbound `message.recv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecvPayload {
    pub content_type: String,
    pub text: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<serde_json::Value>>,
}

impl MessageRecvPayload {
    /// A plain-text reply.
    pub fn text(text: impl Into<String>, reply_to: Option<String>) -> Self {
        Self {
            content_type: CONTENT_TYPE_TEXT.into(),
            text: text.into(),
            reply_to,
            phase: None,
            attachments: None,
        }
    }

    /// The hint sent while an inbound message is being processed.
    pub fn processing(with_media: bool, reply_to: Option<String>) -> Self {
        let hint = if with_media {
            PROCESSING_HINT_MEDIA
        } else {
            PROCESSING_HINT_TEXT
        };
        Self {
            phase: Some("processing".into()),
            ..Self::text(hint, reply_to)
        }
    }

    /// A media reply.
    pub fn media(text: impl Into<String>, attachments: Vec<serde_json::Value>) -> Self {
        Self {
            content_type: CONTENT_TYPE_IMAGE.into(),
            text: text.into(),
            reply_to: None,
            phase: None,
            attachments: Some(attachments),
        }
    }
}

/// Payload of an outbound `message.delta` (streamed reply fragment).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaPayload {
    pub delta: String,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub sequence: u64,
}

/// Payload of an outbound `connection.state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatePayload {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_ms: Option<u64>,
}

impl ConnectionStatePayload {
    pub fn connected() -> Self {
        Self {
            state: "connected".into(),
            attempt: None,
            reason: None,
            next_retry_ms: None,
        }
    }
}

/// Payload of the periodic `presence` heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub status: String,
    pub source: String,
}

impl PresencePayload {
    pub fn online(source: impl Into<String>) -> Self {
        Self {
            status: "online".into(),
            source: source.into(),
        }
    }
}

/// Payload of an outbound `ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub ack: Option<String>,
    pub status: String,
    pub attempt: u32,
    pub received_at: i64,
}

impl AckPayload {
    /// Acknowledges a processed inbound message.
    pub fn processed(ack: Option<String>, attempt: u32) -> Self {
        Self {
            ack,
            status: "processed".into(),
            attempt,
            received_at: now_millis(),
        }
    }
}
