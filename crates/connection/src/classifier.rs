//! Disconnect classification: retry or give up.
//!
//! Rules, first match wins:
//!
//! | # | input | recoverable | reason |
//! |---|-------|-------------|--------|
//! | 1 | close code in the unauthorized set | no | `unauthorized` |
//! | 2 | text has an authorization marker | no | `unauthorized` |
//! | 3 | code 4000 or text has `idle timeout` | yes | `idle_timeout` |
//! | 4 | text has a network marker, or code 1006 | yes | `network_error` |
//! | 5 | anything else | yes | `socket_closed` |
//!
//! "Text" is the close reason and error message, lowercased. Matching on
//! human-readable text is brittle: a server that rewords its close reasons
//! can move a disconnect between rows 2 to 5.

use std::fmt;

use serde::Serialize;

use cloudlink_protocol::constants::{
    CLOSE_ABNORMAL, CLOSE_IDLE_TIMEOUT, REASON_IDLE_TIMEOUT, UNAUTHORIZED_CLOSE_CODES,
};

const UNAUTHORIZED_MARKERS: [&str; 7] = [
    "unauthorized",
    "forbidden",
    "401",
    "403",
    "channel mismatch",
    "device mismatch",
    "invalid signature",
];

const NETWORK_MARKERS: [&str; 6] = [
    "network",
    "timeout",
    "timed out",
    "econn",
    "connection reset",
    "connection refused",
];

/// What is known about a disconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectMeta {
    /// Close code, when a close frame was seen or issued.
    pub code: Option<u16>,
    /// Close reason text.
    pub reason: String,
    /// Transport or handshake error text.
    pub message: String,
}

impl DisconnectMeta {
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: String::new(),
            message: message.into(),
        }
    }

    /// Stream ended without a close frame.
    pub fn abnormal() -> Self {
        Self::close(CLOSE_ABNORMAL, "")
    }

    /// Close reason if present, otherwise the error message.
    pub fn detail(&self) -> &str {
        if self.reason.is_empty() {
            &self.message
        } else {
            &self.reason
        }
    }
}

/// Classified cause of a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Unauthorized,
    NetworkError,
    IdleTimeout,
    SocketClosed,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::NetworkError => "network_error",
            Self::IdleTimeout => "idle_timeout",
            Self::SocketClosed => "socket_closed",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub recoverable: bool,
    pub reason: DisconnectReason,
}

impl Verdict {
    const fn retry(reason: DisconnectReason) -> Self {
        Self {
            recoverable: true,
            reason,
        }
    }

    const fn abandon(reason: DisconnectReason) -> Self {
        Self {
            recoverable: false,
            reason,
        }
    }

    /// `reason` or `reason: detail`, as stored in `last_error`.
    pub fn describe(&self, meta: &DisconnectMeta) -> String {
        match meta.detail() {
            "" => self.reason.to_string(),
            detail => format!("{}: {detail}", self.reason),
        }
    }
}

/// Maps disconnect metadata to a verdict.
pub fn classify(meta: &DisconnectMeta) -> Verdict {
    let code = meta.code.unwrap_or(0);
    let text = format!("{} {}", meta.reason, meta.message).to_lowercase();

    if UNAUTHORIZED_CLOSE_CODES.contains(&code) {
        return Verdict::abandon(DisconnectReason::Unauthorized);
    }
    if UNAUTHORIZED_MARKERS.iter().any(|m| text.contains(m)) {
        return Verdict::abandon(DisconnectReason::Unauthorized);
    }

    // "idle timeout" contains "timeout"; check it before the network markers.
    let idle = code == CLOSE_IDLE_TIMEOUT || text.contains(REASON_IDLE_TIMEOUT);
    if !idle && (code == CLOSE_ABNORMAL || NETWORK_MARKERS.iter().any(|m| text.contains(m))) {
        return Verdict::retry(DisconnectReason::NetworkError);
    }
    if idle {
        return Verdict::retry(DisconnectReason::IdleTimeout);
    }

    Verdict::retry(DisconnectReason::SocketClosed)
}
