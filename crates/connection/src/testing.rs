//! In-memory transport for driving runtimes in tests.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::{sink, stream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

use cloudlink_account::AccountDescriptor;
use cloudlink_protocol::{Envelope, EventName};

use crate::error::ConnectionError;
use crate::socket::{Connector, FrameSink, FrameStream};
use crate::types::{ConnectionState, RuntimeEvent};

/// Upper bound for any wait; paused time makes it free.
pub(crate) const WAIT: Duration = Duration::from_secs(600);

pub(crate) fn account(id: &str) -> AccountDescriptor {
    let mut account = AccountDescriptor::new(id, "ws://cloud.test/ws/device", "dev-1", "secret");
    account.reconnect_jitter = 0.0;
    account
}

/// Server side of one accepted connection.
pub(crate) struct MockPeer {
    pub url: Url,
    /// Frames the runtime wrote.
    pub written: mpsc::UnboundedReceiver<Message>,
    /// Frames to deliver to the runtime. Dropping it ends the stream.
    pub inbound: mpsc::UnboundedSender<Result<Message, tungstenite::Error>>,
}

impl MockPeer {
    pub fn send_text(&self, text: impl Into<String>) {
        let text: String = text.into();
        let _ = self.inbound.send(Ok(Message::Text(text.into())));
    }

    pub fn send_event(&self, name: EventName, msg_id: &str, payload: serde_json::Value) {
        let envelope = Envelope::event(name, "cloud", Some(msg_id.into()), &payload).unwrap();
        self.send_text(envelope.to_json().unwrap());
    }

    pub fn close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };
        let _ = self.inbound.send(Ok(Message::Close(Some(frame))));
    }

    /// Next frame the runtime wrote.
    pub async fn next_frame(&mut self) -> Option<Message> {
        tokio::time::timeout(WAIT, self.written.recv()).await.ok().flatten()
    }

    /// Next text frame carrying the given event, skipping everything else.
    pub async fn next_event(&mut self, name: EventName) -> Envelope {
        loop {
            match self.next_frame().await {
                Some(Message::Text(text)) => {
                    let envelope = Envelope::parse(text.as_str()).unwrap();
                    if envelope.name == name {
                        return envelope;
                    }
                }
                Some(_) => {}
                None => panic!("socket ended before {name:?}"),
            }
        }
    }

    /// Next close frame the runtime wrote, as `(code, reason)`.
    pub async fn next_close(&mut self) -> (u16, String) {
        loop {
            match self.next_frame().await {
                Some(Message::Close(Some(frame))) => {
                    return (u16::from(frame.code), frame.reason.as_str().to_string());
                }
                Some(_) => {}
                None => panic!("socket ended without a close frame"),
            }
        }
    }
}

/// Connector that hands every accepted connection to the test.
pub(crate) struct MockConnector {
    accepted: mpsc::UnboundedSender<MockPeer>,
    failures: Mutex<VecDeque<ConnectionError>>,
}

impl MockConnector {
    pub fn new() -> (Self, MockListener) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Self {
            accepted,
            failures: Mutex::new(VecDeque::new()),
        };
        (connector, MockListener { rx })
    }

    /// The next `connect` fails with `err` instead of accepting.
    pub fn fail_next(&self, err: ConnectionError) {
        self.failures.lock().unwrap().push_back(err);
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        url: Url,
    ) -> Pin<Box<dyn Future<Output = Result<(FrameSink, FrameStream), ConnectionError>> + Send + '_>>
    {
        Box::pin(async move {
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }

            let (written_tx, written) = mpsc::unbounded_channel();
            let (inbound, inbound_rx) = mpsc::unbounded_channel();

            let sink: FrameSink = Box::pin(sink::unfold(
                written_tx,
                |tx: mpsc::UnboundedSender<Message>, msg: Message| async move {
                    tx.send(msg)
                        .map_err(|_| tungstenite::Error::ConnectionClosed)?;
                    Ok::<_, tungstenite::Error>(tx)
                },
            ));
            let stream: FrameStream = Box::pin(stream::unfold(
                inbound_rx,
                |mut rx: mpsc::UnboundedReceiver<Result<Message, tungstenite::Error>>| async move {
                    rx.recv().await.map(|item| (item, rx))
                },
            ));

            let _ = self.accepted.send(MockPeer {
                url,
                written,
                inbound,
            });
            Ok((sink, stream))
        })
    }
}

/// Test-side end of a [`MockConnector`].
pub(crate) struct MockListener {
    rx: mpsc::UnboundedReceiver<MockPeer>,
}

impl MockListener {
    /// Waits for the next connection; `None` if none arrives within [`WAIT`].
    pub async fn accept(&mut self) -> Option<MockPeer> {
        tokio::time::timeout(WAIT, self.rx.recv()).await.ok().flatten()
    }

    /// Waits up to `within` and returns whether a connection arrived.
    pub async fn connects_within(&mut self, within: Duration) -> bool {
        tokio::time::timeout(within, self.rx.recv())
            .await
            .ok()
            .flatten()
            .is_some()
    }
}

/// Waits for a `StateChanged` event to `state`, returning every event seen.
pub(crate) async fn wait_for_state(
    events: &mut mpsc::Receiver<RuntimeEvent>,
    state: ConnectionState,
) -> Vec<RuntimeEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("no transition to {state:?}; saw {seen:?}"));
        let done = matches!(&event, RuntimeEvent::StateChanged { state: s, .. } if *s == state);
        seen.push(event);
        if done {
            return seen;
        }
    }
}
