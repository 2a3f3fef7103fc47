//! Error types for the connection crate.

use tokio_tungstenite::tungstenite;

/// Errors raised while establishing a socket.
///
/// These never reach callers of the send API; the runtime turns them into
/// disconnect metadata for the classifier.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("handshake rejected with HTTP status {status}")]
    Rejected { status: u16 },

    #[error("connect timed out")]
    Timeout,
}

impl ConnectionError {
    /// Maps a handshake failure, pulling the status out of HTTP rejections.
    pub fn from_handshake(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => Self::Rejected {
                status: response.status().as_u16(),
            },
            other => Self::Ws(other),
        }
    }
}

/// Errors from the registry's outbound API.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("account not configured: {0}")]
    NotConfigured(String),
}

/// Errors reported by a reply dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch failed: {0}")]
    Failed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
