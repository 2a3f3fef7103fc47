//! Per-account connection state machine.
//!
//! ```text
//! Stopped ──start──▶ Connecting ──open──▶ Connected
//!    ▲                   │  ▲                 │
//!    │      unrecoverable│  │timer            │close/error
//!    │                   ▼  │                 ▼
//!    └──────────────── Reconnecting ◀── recoverable
//! ```
//!
//! Every socket and timer task is stamped with the generation it was spawned
//! for. Callbacks from an older generation, or arriving after `close()`, are
//! no-ops.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use cloudlink_account::AccountDescriptor;
use cloudlink_auth::{redact_signature, signed_connection_url};
use cloudlink_protocol::constants::{
    CLOSE_IDLE_TIMEOUT, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, DEFAULT_CHANNEL_ID,
    REASON_IDLE_TIMEOUT, REASON_PING_FAILED, REASON_SHUTDOWN,
};
use cloudlink_protocol::envelope::now_millis;
use cloudlink_protocol::messages::{
    AckPayload, ConnectionStatePayload, MessageRecvPayload, MessageSendPayload, PresencePayload,
};
use cloudlink_protocol::{Envelope, EventName};

use crate::backoff::BackoffPolicy;
use crate::classifier::{DisconnectMeta, DisconnectReason, classify};
use crate::dispatch::{InboundContext, ReplyDispatcher, ReplySink};
use crate::pumps::interval::tick_every;
use crate::queue::OutboundQueue;
use crate::socket::{Connector, run_socket};
use crate::types::{ConnectionState, RuntimeEvent, RuntimeSnapshot};

/// Extra writer-channel slots beyond the queue size, so a full flush fits.
const WRITE_HEADROOM: usize = 64;

/// Handle to one account's connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionRuntime {
    shared: Arc<Shared>,
}

struct Shared {
    account_id: String,
    inner: Mutex<Inner>,
    events: Option<mpsc::Sender<RuntimeEvent>>,
    dispatcher: Option<Arc<dyn ReplyDispatcher>>,
    connector: Arc<dyn Connector>,
}

struct SocketHandle {
    generation: u64,
    cancel: CancellationToken,
    /// Set once the socket is open.
    writer: Option<mpsc::Sender<Message>>,
    /// Set when this side initiated the close.
    pending_close: Option<DisconnectMeta>,
}

#[derive(Default)]
struct Timers {
    heartbeat: Option<CancellationToken>,
    keepalive: Option<CancellationToken>,
    idle_check: Option<CancellationToken>,
}

impl Timers {
    fn cancel_all(&mut self) {
        for token in [
            self.heartbeat.take(),
            self.keepalive.take(),
            self.idle_check.take(),
        ]
        .into_iter()
        .flatten()
        {
            token.cancel();
        }
    }
}

struct Inner {
    account: AccountDescriptor,
    state: ConnectionState,
    /// Explicitly closed; cleared only by `start()`.
    stopped: bool,
    running: bool,
    generation: u64,
    socket: Option<SocketHandle>,
    reconnect: Option<CancellationToken>,
    timers: Timers,
    queue: OutboundQueue,
    seq: u64,
    reconnect_attempt: u32,
    /// Monotonic; drives the idle check.
    last_activity: Instant,
    last_start_at: Option<i64>,
    last_stop_at: Option<i64>,
    last_error: Option<String>,
    last_inbound_at: Option<i64>,
    last_outbound_at: Option<i64>,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        !self.stopped && self.socket.as_ref().is_some_and(|s| s.generation == generation)
    }

    /// Writer of the current socket, unless it is closing.
    fn open_writer(&self) -> Option<&mpsc::Sender<Message>> {
        self.socket
            .as_ref()
            .filter(|s| s.pending_close.is_none())
            .and_then(|s| s.writer.as_ref())
    }

    fn touch_inbound(&mut self) {
        self.last_inbound_at = Some(now_millis());
        self.last_activity = Instant::now();
    }

    fn touch_outbound(&mut self) {
        self.last_outbound_at = Some(now_millis());
        self.last_activity = Instant::now();
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

impl ConnectionRuntime {
    /// Creates a stopped runtime. Nothing happens until [`start`](Self::start).
    pub fn new(
        account: AccountDescriptor,
        connector: Arc<dyn Connector>,
        events: Option<mpsc::Sender<RuntimeEvent>>,
        dispatcher: Option<Arc<dyn ReplyDispatcher>>,
    ) -> Self {
        let account_id = account.id.clone();
        let queue = OutboundQueue::new(account.max_queue_size, account_id.clone());
        Self {
            shared: Arc::new(Shared {
                account_id,
                inner: Mutex::new(Inner {
                    account,
                    state: ConnectionState::Stopped,
                    stopped: false,
                    running: false,
                    generation: 0,
                    socket: None,
                    reconnect: None,
                    timers: Timers::default(),
                    queue,
                    seq: 0,
                    reconnect_attempt: 0,
                    last_activity: Instant::now(),
                    last_start_at: None,
                    last_stop_at: None,
                    last_error: None,
                    last_inbound_at: None,
                    last_outbound_at: None,
                }),
                events,
                dispatcher,
                connector,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn account_id(&self) -> &str {
        &self.shared.account_id
    }

    pub fn account(&self) -> AccountDescriptor {
        self.lock().account.clone()
    }

    /// Replaces the stored descriptor; takes effect on the next connect.
    pub fn set_account(&self, account: AccountDescriptor) {
        let mut inner = self.lock();
        inner.queue.set_capacity(account.max_queue_size);
        inner.account = account;
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// `true` while a socket is open.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn reconnect_attempt(&self) -> u32 {
        self.lock().reconnect_attempt
    }

    /// `true` after `close()` until the next `start()`.
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        let inner = self.lock();
        RuntimeSnapshot {
            account_id: self.shared.account_id.clone(),
            state: inner.state,
            running: inner.running,
            queue_size: inner.queue.len(),
            dropped_count: inner.queue.dropped(),
            reconnect_attempt: inner.reconnect_attempt,
            last_start_at: inner.last_start_at,
            last_stop_at: inner.last_stop_at,
            last_error: inner.last_error.clone(),
            last_inbound_at: inner.last_inbound_at,
            last_outbound_at: inner.last_outbound_at,
        }
    }

    /// Next streaming sequence number (starts at 1).
    pub fn next_seq(&self) -> u64 {
        let mut inner = self.lock();
        inner.seq += 1;
        inner.seq
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Clears the stopped flag and connects, unless a socket or reconnect
    /// timer already exists.
    pub fn start(&self) {
        let mut inner = self.lock();
        inner.stopped = false;
        self.activate_locked(&mut inner);
    }

    /// Like [`start`](Self::start), but leaves an explicitly closed runtime
    /// alone.
    pub fn ensure_started(&self) {
        let mut inner = self.lock();
        if !inner.stopped {
            self.activate_locked(&mut inner);
        }
    }

    fn activate_locked(&self, inner: &mut Inner) {
        if inner.socket.is_some() || inner.reconnect.is_some() {
            debug!(account = %self.shared.account_id, "already active");
            return;
        }
        info!(account = %self.shared.account_id, "starting connection");
        self.open_socket_locked(inner);
    }

    /// Stops the runtime: cancels every timer, closes the socket with
    /// `1000 shutdown`, and turns later callbacks into no-ops. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.stopped = true;
        if let Some(token) = inner.reconnect.take() {
            token.cancel();
        }
        inner.timers.cancel_all();
        if let Some(socket) = inner.socket.take() {
            if let Some(writer) = &socket.writer {
                let _ = writer.try_send(close_message(CLOSE_NORMAL, REASON_SHUTDOWN));
            }
            socket.cancel.cancel();
        }
        inner.running = false;
        inner.last_stop_at = Some(now_millis());
        if inner.state != ConnectionState::Stopped {
            info!(account = %self.shared.account_id, "connection closed");
        }
        self.set_state(&mut inner, ConnectionState::Stopped);
    }

    fn open_socket_locked(&self, inner: &mut Inner) {
        if inner.stopped {
            return;
        }
        let account = &inner.account;
        let url = match signed_connection_url(
            &account.endpoint,
            &account.device_id,
            &account.device_secret,
            &account.channel_id,
        ) {
            Ok(url) => url,
            Err(e) => {
                let msg = format!("invalid endpoint: {e}");
                error!(account = %self.shared.account_id, error = %e, "cannot build connection URL");
                inner.last_error = Some(msg.clone());
                inner.running = false;
                self.set_state(inner, ConnectionState::Stopped);
                self.emit(RuntimeEvent::Fatal {
                    account_id: self.shared.account_id.clone(),
                    error: msg,
                });
                return;
            }
        };

        inner.generation += 1;
        let generation = inner.generation;
        let cancel = CancellationToken::new();
        inner.socket = Some(SocketHandle {
            generation,
            cancel: cancel.clone(),
            writer: None,
            pending_close: None,
        });
        self.set_state(inner, ConnectionState::Connecting);
        info!(
            account = %self.shared.account_id,
            url = %redact_signature(&url),
            "opening socket"
        );
        tokio::spawn(run_socket(self.clone(), generation, url, cancel));
    }

    fn schedule_reconnect_locked(&self, inner: &mut Inner, reason: DisconnectReason) {
        if inner.stopped || inner.reconnect.is_some() {
            return;
        }
        inner.reconnect_attempt = inner.reconnect_attempt.saturating_add(1);
        let attempt = inner.reconnect_attempt;
        let delay_ms = BackoffPolicy::from_account(&inner.account).delay_ms(attempt);
        warn!(
            account = %self.shared.account_id,
            attempt,
            delay_ms,
            reason = %reason,
            "scheduling reconnect"
        );
        self.set_state(inner, ConnectionState::Reconnecting);
        self.emit(RuntimeEvent::Reconnecting {
            account_id: self.shared.account_id.clone(),
            attempt,
            delay_ms,
            reason,
        });

        let token = CancellationToken::new();
        inner.reconnect = Some(token.clone());
        let generation = inner.generation;
        let runtime = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                    runtime.on_reconnect_due(generation);
                }
            }
        });
    }

    fn on_reconnect_due(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.stopped || inner.generation != generation || inner.reconnect.is_none() {
            return;
        }
        inner.reconnect = None;
        self.open_socket_locked(&mut inner);
    }

    // -----------------------------------------------------------------------
    // Socket callbacks
    // -----------------------------------------------------------------------

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        self.shared.connector.clone()
    }

    pub(crate) fn write_buffer(&self) -> usize {
        self.lock().account.max_queue_size + WRITE_HEADROOM
    }

    /// Socket opened. Returns `false` if the attempt is stale.
    pub(crate) fn on_open(&self, generation: u64, writer: mpsc::Sender<Message>) -> bool {
        let mut inner = self.lock();
        if !inner.is_current(generation) {
            return false;
        }
        if let Some(socket) = inner.socket.as_mut() {
            socket.writer = Some(writer);
        }

        let now = now_millis();
        inner.running = true;
        inner.last_start_at = Some(now);
        inner.last_inbound_at = Some(now);
        inner.last_outbound_at = Some(now);
        inner.last_activity = Instant::now();
        inner.last_error = None;
        inner.reconnect_attempt = 0;
        self.set_state(&mut inner, ConnectionState::Connected);
        info!(
            account = %self.shared.account_id,
            channel = %inner.account.channel_id,
            "connected"
        );

        self.flush_locked(&mut inner);
        self.send_event_locked(
            &mut inner,
            EventName::ConnectionState,
            None,
            &ConnectionStatePayload::connected(),
        );
        self.arm_timers_locked(&mut inner, generation);
        true
    }

    pub(crate) fn on_text(&self, generation: u64, text: &str) {
        {
            let mut inner = self.lock();
            if !inner.is_current(generation) {
                return;
            }
            inner.touch_inbound();
        }
        self.handle_incoming(text);
    }

    /// Ping, pong, or an undecodable frame arrived.
    pub(crate) fn on_activity(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.is_current(generation) {
            inner.touch_inbound();
        }
    }

    /// Socket closed or failed; classifies and reconnects or gives up.
    pub(crate) fn on_disconnected(&self, generation: u64, meta: DisconnectMeta) {
        let mut inner = self.lock();
        let Some(socket) = inner.socket.take_if(|s| s.generation == generation) else {
            return;
        };
        socket.cancel.cancel();
        inner.timers.cancel_all();
        inner.running = false;
        inner.last_stop_at = Some(now_millis());
        if inner.stopped {
            return;
        }

        let meta = socket.pending_close.unwrap_or(meta);
        let verdict = classify(&meta);
        let description = verdict.describe(&meta);
        inner.last_error = Some(description.clone());
        warn!(
            account = %self.shared.account_id,
            code = meta.code.unwrap_or(0),
            reason = %meta.detail(),
            "socket closed"
        );

        if verdict.recoverable {
            self.schedule_reconnect_locked(&mut inner, verdict.reason);
        } else {
            error!(
                account = %self.shared.account_id,
                error = %description,
                "unrecoverable disconnect, not reconnecting"
            );
            self.set_state(&mut inner, ConnectionState::Stopped);
            self.emit(RuntimeEvent::Fatal {
                account_id: self.shared.account_id.clone(),
                error: description,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn arm_timers_locked(&self, inner: &mut Inner, generation: u64) {
        inner.timers.cancel_all();
        let account = &inner.account;
        let heartbeat = account.heartbeat_interval();
        let keepalive = account.keepalive_interval();
        let idle_check = account.idle_check_interval();

        inner.timers.heartbeat = Some(self.spawn_timer(heartbeat, generation, Self::on_heartbeat));
        inner.timers.keepalive = Some(self.spawn_timer(keepalive, generation, Self::on_keepalive));
        inner.timers.idle_check =
            Some(self.spawn_timer(idle_check, generation, Self::on_idle_check));
    }

    fn spawn_timer(
        &self,
        period: Duration,
        generation: u64,
        on_tick: fn(&Self, u64) -> bool,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let runtime = self.clone();
        tokio::spawn(tick_every(period, token.clone(), move || {
            on_tick(&runtime, generation)
        }));
        token
    }

    fn on_heartbeat(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if !inner.is_current(generation) || inner.state != ConnectionState::Connected {
            return false;
        }
        self.send_event_locked(
            &mut inner,
            EventName::Presence,
            None,
            &PresencePayload::online(DEFAULT_CHANNEL_ID),
        );
        true
    }

    /// Sends a WebSocket ping. A ping that cannot be queued closes the socket
    /// with 1011 and goes through the normal disconnect path. Pings do not
    /// update `last_outbound_at`, so the snapshot only tracks envelopes.
    fn on_keepalive(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if !inner.is_current(generation) {
            return false;
        }
        let Some(writer) = inner.open_writer() else {
            return false;
        };
        match writer.try_send(Message::Ping(Default::default())) {
            Ok(()) => {
                trace!(account = %self.shared.account_id, "ping sent");
                true
            }
            Err(e) => {
                warn!(account = %self.shared.account_id, error = %e, "keepalive ping failed");
                inner.last_error = Some(format!("{REASON_PING_FAILED}: {e}"));
                self.self_close_locked(&mut inner, CLOSE_INTERNAL_ERROR, REASON_PING_FAILED);
                false
            }
        }
    }

    fn on_idle_check(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if !inner.is_current(generation) || inner.state != ConnectionState::Connected {
            return false;
        }
        let silent = inner.last_activity.elapsed();
        if silent < inner.account.idle_timeout() {
            return true;
        }
        warn!(
            account = %self.shared.account_id,
            silent_ms = silent.as_millis() as u64,
            idle_timeout_ms = inner.account.idle_timeout_ms,
            "connection idle, closing"
        );
        self.self_close_locked(&mut inner, CLOSE_IDLE_TIMEOUT, REASON_IDLE_TIMEOUT);
        false
    }

    /// Closes the current socket from this side with a distinguishing code.
    fn self_close_locked(&self, inner: &mut Inner, code: u16, reason: &str) {
        inner.timers.cancel_all();
        let Some(socket) = inner.socket.as_mut() else {
            return;
        };
        if socket.pending_close.is_some() {
            return;
        }
        socket.pending_close = Some(DisconnectMeta::close(code, reason));
        if let Some(writer) = &socket.writer {
            let _ = writer.try_send(close_message(code, reason));
        }
        socket.cancel.cancel();
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Sends an event envelope now, or queues it if the socket is not open.
    /// Never fails; delivery problems surface in the snapshot.
    pub fn send_event<T: Serialize>(&self, name: EventName, msg_id: Option<String>, payload: &T) {
        let mut inner = self.lock();
        self.send_event_locked(&mut inner, name, msg_id, payload);
    }

    /// Sends an already-built envelope.
    pub fn send_envelope(&self, envelope: &Envelope) {
        match envelope.to_json() {
            Ok(frame) => {
                let mut inner = self.lock();
                self.send_frame_locked(&mut inner, frame);
            }
            Err(e) => {
                error!(account = %self.shared.account_id, error = %e, "failed to serialize envelope");
            }
        }
    }

    fn send_event_locked<T: Serialize>(
        &self,
        inner: &mut Inner,
        name: EventName,
        msg_id: Option<String>,
        payload: &T,
    ) {
        let frame = Envelope::event(name, inner.account.device_id.clone(), msg_id, payload)
            .and_then(|envelope| envelope.to_json());
        match frame {
            Ok(frame) => self.send_frame_locked(inner, frame),
            Err(e) => {
                error!(account = %self.shared.account_id, error = %e, "failed to serialize event");
            }
        }
    }

    fn send_frame_locked(&self, inner: &mut Inner, frame: String) {
        let sent = inner
            .open_writer()
            .map(|writer| writer.try_send(Message::Text(frame.clone().into())));
        match sent {
            Some(Ok(())) => {
                inner.touch_outbound();
                return;
            }
            Some(Err(e)) => {
                debug!(account = %self.shared.account_id, error = %e, "send failed, queueing");
                inner.last_error = Some(format!("send failed: {e}"));
            }
            None => {
                trace!(account = %self.shared.account_id, "socket not open, queueing");
            }
        }
        inner.queue.push(frame);
    }

    fn flush_locked(&self, inner: &mut Inner) {
        let Some(writer) = inner.open_writer().cloned() else {
            return;
        };
        let result = inner.queue.drain(|frame| {
            writer
                .try_send(Message::Text(frame.to_owned().into()))
                .map_err(|e| e.to_string())
        });
        match result {
            Ok(0) => {}
            Ok(flushed) => {
                debug!(account = %self.shared.account_id, flushed, "flushed offline queue");
                inner.touch_outbound();
            }
            Err(e) => {
                warn!(
                    account = %self.shared.account_id,
                    remaining = inner.queue.len(),
                    error = %e,
                    "queue flush interrupted"
                );
                inner.last_error = Some(format!("send failed: {e}"));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    fn handle_incoming(&self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(account = %self.shared.account_id, error = %e, "dropping malformed frame");
                return;
            }
        };
        if !envelope.is_event() {
            trace!(account = %self.shared.account_id, kind = %envelope.kind, "ignoring non-event frame");
            return;
        }
        match envelope.name {
            EventName::MessageSend => self.handle_message_send(&envelope),
            other => trace!(account = %self.shared.account_id, name = ?other, "ignoring inbound event"),
        }
    }

    /// Processing hint, hand-off to the dispatcher, then ack.
    fn handle_message_send(&self, envelope: &Envelope) {
        let payload: MessageSendPayload = envelope.parse_payload().unwrap_or_else(|e| {
            debug!(account = %self.shared.account_id, error = %e, "unreadable message.send payload");
            MessageSendPayload::default()
        });
        let msg_id = envelope.msg_id().map(str::to_owned);
        let ctx = InboundContext::from_message(&self.shared.account_id, envelope, &payload);
        let with_media = payload.has_attachments() || !ctx.media_urls.is_empty();

        info!(
            account = %self.shared.account_id,
            msg_id = msg_id.as_deref().unwrap_or(""),
            text_len = ctx.text.len(),
            attachments = payload.attachments.len(),
            media_urls = ctx.media_urls.len(),
            "inbound message.send"
        );

        self.send_event(
            EventName::MessageRecv,
            msg_id.clone(),
            &MessageRecvPayload::processing(with_media, msg_id.clone()),
        );

        match &self.shared.dispatcher {
            Some(_) if ctx.is_empty() => warn!(
                account = %self.shared.account_id,
                msg_id = msg_id.as_deref().unwrap_or(""),
                "dropped inbound: no text or media to dispatch"
            ),
            Some(dispatcher) => {
                let dispatcher = dispatcher.clone();
                let sink = ReplySink::new(self.clone(), msg_id.clone());
                let account = self.shared.account_id.clone();
                tokio::spawn(async move {
                    let msg_id = ctx.msg_id.clone().unwrap_or_default();
                    match dispatcher.dispatch(ctx, sink).await {
                        Ok(true) => info!(account = %account, msg_id = %msg_id, "inbound dispatched"),
                        Ok(false) => warn!(account = %account, msg_id = %msg_id, "inbound not handled by dispatcher"),
                        Err(e) => error!(account = %account, msg_id = %msg_id, error = %e, "inbound dispatch failed"),
                    }
                });
            }
            None => debug!(account = %self.shared.account_id, "no reply dispatcher configured"),
        }

        let attempt = self.lock().reconnect_attempt;
        self.send_event(
            EventName::Ack,
            None,
            &AckPayload::processed(msg_id, attempt),
        );
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state == state {
            return;
        }
        debug!(account = %self.shared.account_id, from = ?inner.state, to = ?state, "state change");
        inner.state = state;
        self.emit(RuntimeEvent::StateChanged {
            account_id: self.shared.account_id.clone(),
            state,
        });
    }

    fn emit(&self, event: RuntimeEvent) {
        let Some(tx) = &self.shared.events else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            debug!(account = %self.shared.account_id, "runtime event not delivered: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use serde_json::json;

    use cloudlink_protocol::messages::{PROCESSING_HINT_MEDIA, PROCESSING_HINT_TEXT};

    use crate::dispatch::InboundContext;
    use crate::error::{ConnectionError, DispatchError};
    use crate::testing::{MockConnector, MockListener, MockPeer, account, wait_for_state};

    struct Harness {
        runtime: ConnectionRuntime,
        listener: MockListener,
        events: mpsc::Receiver<RuntimeEvent>,
        connector: Arc<MockConnector>,
    }

    fn harness(account: AccountDescriptor, dispatcher: Option<Arc<dyn ReplyDispatcher>>) -> Harness {
        let (connector, listener) = MockConnector::new();
        let connector = Arc::new(connector);
        let (tx, events) = mpsc::channel(64);
        let runtime = ConnectionRuntime::new(account, connector.clone(), Some(tx), dispatcher);
        Harness {
            runtime,
            listener,
            events,
            connector,
        }
    }

    async fn next_envelope(peer: &mut MockPeer) -> Envelope {
        loop {
            match peer.next_frame().await {
                Some(Message::Text(text)) => return Envelope::parse(text.as_str()).unwrap(),
                Some(_) => {}
                None => panic!("socket ended"),
            }
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<RuntimeEvent>) -> RuntimeEvent {
        tokio::time::timeout(crate::testing::WAIT, events.recv())
            .await
            .ok()
            .flatten()
            .expect("runtime event")
    }

    /// Starts the runtime and waits until it is connected.
    async fn connected(h: &mut Harness) -> MockPeer {
        h.runtime.start();
        let mut peer = h.listener.accept().await.expect("connection");
        peer.next_event(EventName::ConnectionState).await;
        wait_for_state(&mut h.events, ConnectionState::Connected).await;
        peer
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<InboundContext>>,
    }

    impl ReplyDispatcher for Recorder {
        fn dispatch(
            &self,
            ctx: InboundContext,
            sink: ReplySink,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool, DispatchError>> + Send + '_>>
        {
            Box::pin(async move {
                sink.block("part");
                sink.finish(&format!("echo: {}", ctx.text));
                self.seen.lock().unwrap().push(ctx);
                Ok(true)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_connects_with_signed_url_and_announces() {
        let mut h = harness(account("acct"), None);
        h.runtime.start();
        let mut peer = h.listener.accept().await.unwrap();

        assert_eq!(peer.url.path(), "/ws/device");
        let query: HashMap<String, String> = peer.url.query_pairs().into_owned().collect();
        assert_eq!(query["deviceId"], "dev-1");
        assert_eq!(query["channelId"], DEFAULT_CHANNEL_ID);
        assert!(query.contains_key("ts"));
        assert!(query.contains_key("sig"));

        let hello = next_envelope(&mut peer).await;
        assert_eq!(hello.name, EventName::ConnectionState);
        assert_eq!(hello.payload["state"], "connected");
        assert_eq!(hello.device_id, "dev-1");

        let seen = wait_for_state(&mut h.events, ConnectionState::Connected).await;
        assert_eq!(
            seen[0],
            RuntimeEvent::StateChanged {
                account_id: "acct".into(),
                state: ConnectionState::Connecting,
            }
        );

        let snap = h.runtime.snapshot();
        assert!(snap.running);
        assert_eq!(snap.state, ConnectionState::Connected);
        assert_eq!(snap.reconnect_attempt, 0);
        assert_eq!(snap.last_error, None);
        assert!(snap.last_start_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_sends_are_bounded_and_flushed_in_order() {
        let mut acct = account("acct");
        acct.max_queue_size = 2;
        let mut h = harness(acct, None);

        for text in ["msg1", "msg2", "msg3"] {
            h.runtime.send_event(
                EventName::MessageRecv,
                None,
                &MessageRecvPayload::text(text, None),
            );
        }
        let snap = h.runtime.snapshot();
        assert_eq!(snap.queue_size, 2);
        assert_eq!(snap.dropped_count, 1);

        h.runtime.start();
        let mut peer = h.listener.accept().await.unwrap();
        assert_eq!(next_envelope(&mut peer).await.payload["text"], "msg2");
        assert_eq!(next_envelope(&mut peer).await.payload["text"], "msg3");
        assert_eq!(
            next_envelope(&mut peer).await.name,
            EventName::ConnectionState
        );
        assert_eq!(h.runtime.snapshot().queue_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_connected_goes_straight_out() {
        let mut h = harness(account("acct"), None);
        let mut peer = connected(&mut h).await;

        h.runtime.send_event(
            EventName::MessageRecv,
            Some("out-1".into()),
            &MessageRecvPayload::text("hello", Some("in-1".into())),
        );
        let env = peer.next_event(EventName::MessageRecv).await;
        assert_eq!(env.msg_id, "out-1");
        assert_eq!(env.payload["text"], "hello");
        assert_eq!(env.payload["replyTo"], "in-1");
        assert_eq!(h.runtime.snapshot().queue_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_close_reconnects_after_backoff() {
        let mut h = harness(account("acct"), None);
        let peer = connected(&mut h).await;

        let closed_at = Instant::now();
        peer.close(1001, "going away");
        wait_for_state(&mut h.events, ConnectionState::Reconnecting).await;
        assert_eq!(
            next_event(&mut h.events).await,
            RuntimeEvent::Reconnecting {
                account_id: "acct".into(),
                attempt: 1,
                delay_ms: 2_000,
                reason: DisconnectReason::SocketClosed,
            }
        );

        let snap = h.runtime.snapshot();
        assert!(!snap.running);
        assert_eq!(snap.reconnect_attempt, 1);
        assert_eq!(snap.last_error.as_deref(), Some("socket_closed: going away"));

        let mut peer = h.listener.accept().await.unwrap();
        assert!(closed_at.elapsed() >= Duration::from_millis(2_000));
        peer.next_event(EventName::ConnectionState).await;
        wait_for_state(&mut h.events, ConnectionState::Connected).await;

        let snap = h.runtime.snapshot();
        assert_eq!(snap.reconnect_attempt, 0);
        assert_eq!(snap.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_stream_is_a_network_error() {
        let mut h = harness(account("acct"), None);
        let peer = connected(&mut h).await;

        drop(peer);
        wait_for_state(&mut h.events, ConnectionState::Reconnecting).await;
        match next_event(&mut h.events).await {
            RuntimeEvent::Reconnecting { reason, .. } => {
                assert_eq!(reason, DisconnectReason::NetworkError)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            h.runtime.snapshot().last_error.as_deref(),
            Some("network_error")
        );
        assert!(h.listener.accept().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_close_is_fatal() {
        let mut h = harness(account("acct"), None);
        let peer = connected(&mut h).await;

        peer.close(4401, "");
        wait_for_state(&mut h.events, ConnectionState::Stopped).await;
        assert_eq!(
            next_event(&mut h.events).await,
            RuntimeEvent::Fatal {
                account_id: "acct".into(),
                error: "unauthorized".into(),
            }
        );
        assert!(!h.listener.connects_within(Duration::from_secs(120)).await);

        let snap = h.runtime.snapshot();
        assert_eq!(snap.state, ConnectionState::Stopped);
        assert_eq!(snap.last_error.as_deref(), Some("unauthorized"));
        assert!(!h.runtime.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_back_off_then_reset() {
        let mut h = harness(account("acct"), None);
        for _ in 0..3 {
            h.connector.fail_next(ConnectionError::Timeout);
        }
        h.runtime.start();

        let seen = wait_for_state(&mut h.events, ConnectionState::Connected).await;
        let retries: Vec<(u32, u64, DisconnectReason)> = seen
            .into_iter()
            .filter_map(|e| match e {
                RuntimeEvent::Reconnecting {
                    attempt,
                    delay_ms,
                    reason,
                    ..
                } => Some((attempt, delay_ms, reason)),
                _ => None,
            })
            .collect();
        assert_eq!(
            retries,
            vec![
                (1, 2_000, DisconnectReason::NetworkError),
                (2, 3_600, DisconnectReason::NetworkError),
                (3, 6_480, DisconnectReason::NetworkError),
            ]
        );
        assert_eq!(h.runtime.reconnect_attempt(), 0);
        assert!(h.listener.accept().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_handshake_is_fatal() {
        let mut h = harness(account("acct"), None);
        h.connector
            .fail_next(ConnectionError::Rejected { status: 401 });
        h.runtime.start();

        let seen = wait_for_state(&mut h.events, ConnectionState::Stopped).await;
        assert!(
            !seen
                .iter()
                .any(|e| matches!(e, RuntimeEvent::Reconnecting { .. }))
        );
        assert_eq!(
            h.runtime.snapshot().last_error.as_deref(),
            Some("unauthorized: handshake rejected with HTTP status 401")
        );
        assert!(!h.listener.connects_within(Duration::from_secs(120)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_endpoint_is_fatal_without_retry() {
        let mut acct = account("acct");
        acct.endpoint = "ftp://cloud.test".into();
        let mut h = harness(acct, None);
        h.runtime.start();

        match next_event(&mut h.events).await {
            RuntimeEvent::Fatal { error, .. } => assert!(error.starts_with("invalid endpoint")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.runtime.state(), ConnectionState::Stopped);
        assert!(!h.listener.connects_within(Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_is_closed_as_idle() {
        let mut acct = account("acct");
        acct.idle_timeout_ms = 30_000;
        acct.heartbeat_ms = 600_000;
        acct.keepalive_ping_ms = 600_000;
        let mut h = harness(acct, None);
        let mut peer = connected(&mut h).await;

        let opened = Instant::now();
        let (code, reason) = peer.next_close().await;
        assert_eq!((code, reason.as_str()), (CLOSE_IDLE_TIMEOUT, REASON_IDLE_TIMEOUT));
        assert!(opened.elapsed() >= Duration::from_millis(30_000));

        wait_for_state(&mut h.events, ConnectionState::Reconnecting).await;
        match next_event(&mut h.events).await {
            RuntimeEvent::Reconnecting { reason, attempt, .. } => {
                assert_eq!(reason, DisconnectReason::IdleTimeout);
                assert_eq!(attempt, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            h.runtime.snapshot().last_error.as_deref(),
            Some("idle_timeout: idle timeout")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_traffic_postpones_idle_close() {
        let mut acct = account("acct");
        acct.idle_timeout_ms = 30_000;
        acct.heartbeat_ms = 600_000;
        acct.keepalive_ping_ms = 600_000;
        let mut h = harness(acct, None);
        let mut peer = connected(&mut h).await;

        let opened = Instant::now();
        tokio::time::sleep(Duration::from_secs(20)).await;
        peer.send_event(EventName::Presence, "p1", json!({"status": "online"}));

        let (code, _) = peer.next_close().await;
        assert_eq!(code, CLOSE_IDLE_TIMEOUT);
        assert!(opened.elapsed() >= Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_and_heartbeats() {
        let mut acct = account("acct");
        acct.keepalive_ping_ms = 10_000;
        acct.heartbeat_ms = 20_000;
        let mut h = harness(acct, None);
        let mut peer = connected(&mut h).await;

        let opened = Instant::now();
        loop {
            match peer.next_frame().await {
                Some(Message::Ping(_)) => break,
                Some(_) => {}
                None => panic!("socket ended"),
            }
        }
        assert!(opened.elapsed() >= Duration::from_secs(10));

        let presence = peer.next_event(EventName::Presence).await;
        assert_eq!(presence.payload, json!({"status": "online", "source": DEFAULT_CHANNEL_ID}));
        assert!(opened.elapsed() >= Duration::from_secs(20));
        assert_eq!(h.runtime.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_graceful_and_idempotent() {
        let mut h = harness(account("acct"), None);
        let mut peer = connected(&mut h).await;

        h.runtime.close();
        assert_eq!(
            peer.next_close().await,
            (CLOSE_NORMAL, REASON_SHUTDOWN.to_string())
        );
        assert_eq!(h.runtime.state(), ConnectionState::Stopped);
        assert!(h.runtime.is_stopped());

        h.runtime.close();
        assert_eq!(h.runtime.state(), ConnectionState::Stopped);
        assert!(!h.runtime.is_running());
        assert!(!h.listener.connects_within(Duration::from_secs(120)).await);

        h.runtime.ensure_started();
        assert!(!h.listener.connects_within(Duration::from_secs(10)).await);

        h.runtime.start();
        assert!(h.listener.accept().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_reconnect() {
        let mut h = harness(account("acct"), None);
        let peer = connected(&mut h).await;

        peer.close(1001, "");
        wait_for_state(&mut h.events, ConnectionState::Reconnecting).await;
        h.runtime.close();
        assert!(!h.listener.connects_within(Duration::from_secs(120)).await);
        assert_eq!(h.runtime.state(), ConnectionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_start_opens_one_socket() {
        let mut h = harness(account("acct"), None);
        h.runtime.start();
        h.runtime.start();
        h.runtime.ensure_started();
        let _peer = h.listener.accept().await.expect("connection");
        assert!(!h.listener.connects_within(Duration::from_secs(60)).await);
        assert!(h.runtime.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ping_closes_and_reconnects() {
        let mut acct = account("acct");
        acct.keepalive_ping_ms = 600_000;
        acct.heartbeat_ms = 600_000;
        let mut h = harness(acct, None);
        let _peer = connected(&mut h).await;

        let generation = {
            let mut inner = h.runtime.lock();
            let (closed, rx) = mpsc::channel(1);
            drop(rx);
            inner.socket.as_mut().unwrap().writer = Some(closed);
            inner.generation
        };
        assert!(!h.runtime.on_keepalive(generation));
        assert_eq!(
            h.runtime.lock().socket.as_ref().unwrap().pending_close,
            Some(DisconnectMeta::close(CLOSE_INTERNAL_ERROR, REASON_PING_FAILED))
        );

        wait_for_state(&mut h.events, ConnectionState::Reconnecting).await;
        match next_event(&mut h.events).await {
            RuntimeEvent::Reconnecting { attempt, reason, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(reason, DisconnectReason::SocketClosed);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            h.runtime.snapshot().last_error.as_deref(),
            Some("socket_closed: ping failed")
        );
        let _next = h.listener.accept().await.expect("reconnect");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_callbacks_are_ignored() {
        let mut h = harness(account("acct"), None);
        let _peer = connected(&mut h).await;
        let generation = h.runtime.lock().generation;

        h.runtime
            .on_disconnected(generation + 1, DisconnectMeta::close(4401, ""));
        assert_eq!(h.runtime.state(), ConnectionState::Connected);
        let (tx, _rx) = mpsc::channel(1);
        assert!(!h.runtime.on_open(generation + 1, tx));

        h.runtime.close();
        let stopped_at = h.runtime.snapshot();
        h.runtime
            .on_disconnected(generation, DisconnectMeta::abnormal());
        h.runtime.on_reconnect_due(generation);
        h.runtime.on_activity(generation);
        h.runtime.on_text(generation, "{}");
        assert_eq!(h.runtime.snapshot(), stopped_at);
        assert!(!h.listener.connects_within(Duration::from_secs(120)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_message_gets_hint_replies_and_ack() {
        let recorder = Arc::new(Recorder::default());
        let mut h = harness(account("acct"), Some(recorder.clone()));
        let mut peer = connected(&mut h).await;

        peer.send_event(
            EventName::MessageSend,
            "m1",
            json!({"text": "  hi  ", "senderId": "u1"}),
        );

        let hint = next_envelope(&mut peer).await;
        assert_eq!(hint.name, EventName::MessageRecv);
        assert_eq!(hint.msg_id, "m1");
        assert_eq!(hint.payload["phase"], "processing");
        assert_eq!(hint.payload["replyTo"], "m1");
        assert_eq!(hint.payload["text"], PROCESSING_HINT_TEXT);

        let ack = next_envelope(&mut peer).await;
        assert_eq!(ack.name, EventName::Ack);
        assert_eq!(ack.payload["ack"], "m1");
        assert_eq!(ack.payload["status"], "processed");
        assert_eq!(ack.payload["attempt"], 0);

        let delta = next_envelope(&mut peer).await;
        assert_eq!(delta.name, EventName::MessageDelta);
        assert_eq!(delta.msg_id, "m1");
        assert_eq!(
            delta.payload,
            json!({"delta": "part", "final": false, "sequence": 1})
        );

        let reply = next_envelope(&mut peer).await;
        assert_eq!(reply.name, EventName::MessageRecv);
        assert_eq!(reply.payload["text"], "echo: hi");
        assert_eq!(reply.payload["replyTo"], "m1");
        assert_eq!(reply.payload["contentType"], "text/plain");

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].peer_id, "u1");
        assert_eq!(seen[0].msg_id.as_deref(), Some("m1"));
        assert_eq!(seen[0].account_id, "acct");
    }

    #[tokio::test(start_paused = true)]
    async fn attachment_changes_processing_hint() {
        let mut h = harness(account("acct"), None);
        let mut peer = connected(&mut h).await;

        peer.send_event(
            EventName::MessageSend,
            "m2",
            json!({"attachments": [{"fileName": "a.png", "url": "https://cdn/a.png"}]}),
        );
        let hint = peer.next_event(EventName::MessageRecv).await;
        assert_eq!(hint.payload["text"], PROCESSING_HINT_MEDIA);
        peer.next_event(EventName::Ack).await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_and_empty_frames_are_dropped() {
        let recorder = Arc::new(Recorder::default());
        let mut h = harness(account("acct"), Some(recorder.clone()));
        let mut peer = connected(&mut h).await;

        peer.send_text("not json");
        peer.send_text(r#"{"type":"response","name":"message.send"}"#);
        peer.send_event(EventName::MessageSend, "empty", json!({"text": "   "}));
        peer.send_event(EventName::MessageSend, "real", json!({"text": "x"}));

        let ack = peer.next_event(EventName::Ack).await;
        assert_eq!(ack.payload["ack"], "empty");
        let reply = loop {
            let env = peer.next_event(EventName::MessageRecv).await;
            if env.payload["phase"].is_null() {
                break env;
            }
        };
        assert_eq!(reply.payload["replyTo"], "real");

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].text, "x");
        assert_eq!(h.runtime.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn sequence_numbers_increase() {
        let h = harness(account("acct"), None);
        assert_eq!(h.runtime.next_seq(), 1);
        assert_eq!(h.runtime.next_seq(), 2);
        assert_eq!(h.runtime.next_seq(), 3);
    }

    #[tokio::test]
    async fn set_account_resizes_queue() {
        let h = harness(account("acct"), None);
        for i in 0..3 {
            h.runtime
                .send_event(EventName::Presence, None, &json!({ "n": i }));
        }
        let mut acct = account("acct");
        acct.max_queue_size = 1;
        h.runtime.set_account(acct);
        let snap = h.runtime.snapshot();
        assert_eq!(snap.queue_size, 1);
        assert_eq!(snap.dropped_count, 2);
        assert_eq!(h.runtime.account().max_queue_size, 1);
    }
}
