//! Inbound message hand-off and reply delivery.
//!
//! The runtime turns each inbound `message.send` into an [`InboundContext`]
//! and passes it to a [`ReplyDispatcher`] along with a [`ReplySink`] bound to
//! the originating message. Whatever produces replies lives behind the trait.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use cloudlink_protocol::messages::{
    MessageDeltaPayload, MessageRecvPayload, MessageSendPayload, attachment_link,
};
use cloudlink_protocol::{Envelope, EventName};

use crate::error::DispatchError;
use crate::runtime::ConnectionRuntime;

/// Normalized inbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundContext {
    pub account_id: String,
    /// Inbound `msgId`; replies reference it.
    pub msg_id: Option<String>,
    pub session_id: Option<String>,
    /// `senderId`, `from`, session id, msg id, then `"app"`.
    pub peer_id: String,
    /// Trimmed message text.
    pub text: String,
    /// Text plus the attachment summary; what a reply generator should read.
    pub body: String,
    pub media_urls: Vec<String>,
    pub attachments: Vec<Value>,
}

impl InboundContext {
    pub fn from_message(account_id: &str, envelope: &Envelope, payload: &MessageSendPayload) -> Self {
        let text = payload.text().to_string();
        let media_urls = payload.media_urls();
        let summary = attachment_summary(&payload.attachments, &media_urls);
        let body = [text.as_str(), summary.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        let peer_id = payload
            .peer_id(envelope.session_id.as_deref(), envelope.msg_id())
            .to_string();

        Self {
            account_id: account_id.to_string(),
            msg_id: envelope.msg_id().map(str::to_owned),
            session_id: envelope.session_id.clone().filter(|s| !s.is_empty()),
            peer_id,
            text,
            body,
            media_urls,
            attachments: payload.attachments.clone(),
        }
    }

    /// `true` when there is nothing to hand to a reply generator.
    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }
}

fn str_field<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| item.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Renders attachments as a bullet list for the message body.
///
/// ```text
/// Attachments:
/// - photo.png (image/png | https://cdn/p.png)
/// - media (https://cdn/extra.png)
/// ```
pub fn attachment_summary(attachments: &[Value], media_urls: &[String]) -> String {
    let mut lines = Vec::new();
    let mut seen: Vec<&str> = Vec::new();

    for (index, item) in attachments.iter().enumerate() {
        let name = str_field(item, &["fileName", "filename", "name"])
            .map(str::to_owned)
            .unwrap_or_else(|| format!("attachment-{}", index + 1));
        let mime = str_field(item, &["mime", "contentType"]);
        let url = attachment_link(item).map(str::trim).filter(|u| !u.is_empty());
        if let Some(url) = url {
            seen.push(url);
        }
        let tags: Vec<&str> = [mime, url].into_iter().flatten().collect();
        if tags.is_empty() {
            lines.push(format!("- {name}"));
        } else {
            lines.push(format!("- {name} ({})", tags.join(" | ")));
        }
    }

    for url in media_urls {
        if !seen.contains(&url.as_str()) {
            lines.push(format!("- media ({url})"));
        }
    }

    if lines.is_empty() {
        String::new()
    } else {
        format!("Attachments:\n{}", lines.join("\n"))
    }
}

/// How a reply fragment should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Streamed partial reply (`message.delta`).
    Block,
    /// Complete reply (`message.recv`).
    Final,
}

/// Sends replies for one inbound message through its runtime.
#[derive(Clone)]
pub struct ReplySink {
    runtime: ConnectionRuntime,
    reply_to: Option<String>,
}

impl ReplySink {
    pub fn new(runtime: ConnectionRuntime, reply_to: Option<String>) -> Self {
        Self { runtime, reply_to }
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Sends one reply fragment. Empty text is skipped.
    pub fn deliver(&self, text: &str, kind: DeliveryKind) {
        if text.is_empty() {
            return;
        }
        match kind {
            DeliveryKind::Block => {
                let payload = MessageDeltaPayload {
                    delta: text.to_string(),
                    is_final: false,
                    sequence: self.runtime.next_seq(),
                };
                self.runtime
                    .send_event(EventName::MessageDelta, self.reply_to.clone(), &payload);
            }
            DeliveryKind::Final => {
                let payload = MessageRecvPayload::text(text, self.reply_to.clone());
                self.runtime
                    .send_event(EventName::MessageRecv, self.reply_to.clone(), &payload);
            }
        }
    }

    pub fn block(&self, text: &str) {
        self.deliver(text, DeliveryKind::Block);
    }

    pub fn finish(&self, text: &str) {
        self.deliver(text, DeliveryKind::Final);
    }
}

/// Produces replies for inbound messages.
pub trait ReplyDispatcher: Send + Sync {
    /// Handles one inbound message. Returns `Ok(false)` when the message had
    /// nothing to act on.
    fn dispatch(
        &self,
        ctx: InboundContext,
        sink: ReplySink,
    ) -> Pin<Box<dyn Future<Output = Result<bool, DispatchError>> + Send + '_>>;
}
