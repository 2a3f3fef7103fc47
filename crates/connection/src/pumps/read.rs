//! WebSocket read pump: turns incoming frames into runtime callbacks.

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use cloudlink_protocol::constants::{CLOSE_ABNORMAL, CLOSE_NO_STATUS};

use crate::classifier::DisconnectMeta;

/// Reads frames until the stream ends, a close frame arrives, or `cancel`
/// fires.
///
/// Text (and UTF-8 binary) frames go to `on_text`; pings are answered and,
/// like pongs, reported through `on_activity`. Returns `None` when stopped by
/// `cancel`, otherwise what is known about why the socket went away.
pub(crate) async fn read_pump<S, T, A>(
    mut read: S,
    write_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    mut on_text: T,
    mut on_activity: A,
) -> Option<DisconnectMeta>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    T: FnMut(&str),
    A: FnMut(),
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => on_text(text.as_str()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => on_text(text),
                        Err(_) => {
                            debug!(len = data.len(), "ignoring non-UTF-8 binary frame");
                            on_activity();
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        trace!("received ping, sending pong");
                        on_activity();
                        let _ = write_tx.try_send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        trace!("received pong");
                        on_activity();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "received close frame");
                        return Some(match frame {
                            Some(f) => DisconnectMeta::close(u16::from(f.code), f.reason.as_str()),
                            None => DisconnectMeta::close(CLOSE_NO_STATUS, ""),
                        });
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        error!("WebSocket read error: {e}");
                        return Some(DisconnectMeta {
                            code: Some(CLOSE_ABNORMAL),
                            reason: String::new(),
                            message: e.to_string(),
                        });
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        return Some(DisconnectMeta::abnormal());
                    }
                }
            }
        }
    }
}
