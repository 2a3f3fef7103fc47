//! WebSocket write pump: serialises outbound frames onto the sink.

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Writes frames until cancelled, the channel closes, or a write fails.
///
/// On cancel, frames already in the channel (typically a close frame) are
/// still written. A write failure cancels `cancel` so the reader stops too,
/// and the error text is returned.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) -> Option<String>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut close_sent = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                let Some(msg) = msg else { break };
                close_sent |= msg.is_close();
                if let Err(e) = write.send(msg).await {
                    error!("WebSocket write error: {e}");
                    cancel.cancel();
                    return Some(e.to_string());
                }
            }
        }
    }

    while let Ok(msg) = write_rx.try_recv() {
        close_sent |= msg.is_close();
        if let Err(e) = write.send(msg).await {
            debug!("write during shutdown failed: {e}");
            return None;
        }
    }

    if !close_sent {
        let _ = write.send(Message::Close(None)).await;
    }
    let _ = write.close().await;
    None
}
