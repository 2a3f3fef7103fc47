//! Socket establishment and the per-connection task.
//!
//! The runtime never touches a WebSocket type directly: a [`Connector`]
//! yields a boxed sink/stream pair, and [`run_socket`] wires the pumps to the
//! runtime's callbacks for exactly one connection attempt.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{Sink, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::classifier::DisconnectMeta;
use crate::error::ConnectionError;
use crate::pumps::{read::read_pump, write::write_pump};
use crate::runtime::ConnectionRuntime;

/// Upper bound for a single inbound message.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Handshake timeout used by [`WsConnector::default`].
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound half of a socket.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

/// Inbound half of a socket.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// Opens sockets for a runtime.
pub trait Connector: Send + Sync {
    /// Connects to the signed URL and returns the split socket.
    fn connect(
        &self,
        url: Url,
    ) -> Pin<Box<dyn Future<Output = Result<(FrameSink, FrameStream), ConnectionError>> + Send + '_>>;
}

/// `tokio-tungstenite` client connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
    pub connect_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl Connector for WsConnector {
    fn connect(
        &self,
        url: Url,
    ) -> Pin<Box<dyn Future<Output = Result<(FrameSink, FrameStream), ConnectionError>> + Send + '_>>
    {
        Box::pin(async move {
            let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
            ws_config.max_message_size = Some(self.max_message_size);
            ws_config.max_frame_size = Some(self.max_message_size);

            let handshake =
                tokio_tungstenite::connect_async_with_config(url.as_str(), Some(ws_config), false);
            let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, handshake)
                .await
                .map_err(|_| ConnectionError::Timeout)?
                .map_err(ConnectionError::from_handshake)?;

            let (write, read) = ws_stream.split();
            let sink: FrameSink = Box::pin(write);
            let stream: FrameStream = Box::pin(read);
            Ok((sink, stream))
        })
    }
}

/// Drives one connection attempt for `generation` until it ends, then
/// reports the outcome to the runtime.
pub(crate) async fn run_socket(
    runtime: ConnectionRuntime,
    generation: u64,
    url: Url,
    cancel: CancellationToken,
) {
    let connector = runtime.connector();
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(account = %runtime.account_id(), "connect abandoned");
            return;
        }
        result = connector.connect(url) => result,
    };

    let (sink, stream) = match connected {
        Ok(pair) => pair,
        Err(e) => {
            runtime.on_disconnected(generation, DisconnectMeta::error(e.to_string()));
            return;
        }
    };

    let (write_tx, write_rx) = mpsc::channel(runtime.write_buffer());
    let writer = tokio::spawn(write_pump(sink, write_rx, cancel.clone()));

    if !runtime.on_open(generation, write_tx.clone()) {
        cancel.cancel();
        let _ = writer.await;
        return;
    }

    let read_meta = {
        let on_text = runtime.clone();
        let on_activity = runtime.clone();
        read_pump(
            stream,
            write_tx,
            cancel.clone(),
            move |text| on_text.on_text(generation, text),
            move || on_activity.on_activity(generation),
        )
        .await
    };

    cancel.cancel();
    let write_err = writer.await.ok().flatten();

    let meta = read_meta
        .or_else(|| write_err.map(DisconnectMeta::error))
        .unwrap_or_else(DisconnectMeta::abnormal);
    runtime.on_disconnected(generation, meta);
}
