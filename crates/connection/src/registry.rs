//! Registry of connection runtimes, one per account id.
//!
//! The registry owns the latest channel configuration, creates runtimes on
//! demand, and is the only place runtimes are looked up by account id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cloudlink_account::{AccountDescriptor, resolve_account};
use cloudlink_protocol::EventName;
use cloudlink_protocol::messages::{MessageDeltaPayload, MessageRecvPayload};

use crate::dispatch::ReplyDispatcher;
use crate::error::RegistryError;
use crate::probe::run_probe;
use crate::runtime::ConnectionRuntime;
use crate::socket::{Connector, WsConnector};
use crate::types::{AccountStatus, RuntimeEvent, RuntimeSnapshot};

/// `last_error` reported for a missing or disabled account.
pub const STATUS_DISABLED: &str = "disabled";
/// `last_error` reported for an account without endpoint or credentials.
pub const STATUS_NOT_CONFIGURED: &str = "not configured";

const EVENT_CHANNEL_SIZE: usize = 64;

/// Collaborators and tuning shared by every runtime of a registry.
#[derive(Clone)]
pub struct RegistryOptions {
    pub connector: Arc<dyn Connector>,
    pub dispatcher: Option<Arc<dyn ReplyDispatcher>>,
    /// How often `run_account` publishes status.
    pub status_interval: Duration,
    /// Run the HTTP health probe when an account starts.
    pub probe: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            connector: Arc::new(WsConnector::default()),
            dispatcher: None,
            status_interval: Duration::from_secs(1),
            probe: true,
        }
    }
}

/// Account id to runtime map.
pub struct RuntimeRegistry {
    runtimes: RwLock<HashMap<String, ConnectionRuntime>>,
    config: RwLock<Value>,
    options: RegistryOptions,
    http: reqwest::Client,
    events_tx: mpsc::Sender<RuntimeEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<RuntimeEvent>>>,
}

impl RuntimeRegistry {
    pub fn new(config: Value, options: RegistryOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        Self {
            runtimes: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
            options,
            http: reqwest::Client::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<RuntimeEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Replaces the configuration used to resolve accounts.
    pub async fn set_config(&self, config: Value) {
        *self.config.write().await = config;
    }

    pub async fn config(&self) -> Value {
        self.config.read().await.clone()
    }

    /// Returns the runtime for `account.id`, refreshing its descriptor, or
    /// creates a stopped one.
    pub async fn ensure(&self, account: AccountDescriptor) -> ConnectionRuntime {
        let mut runtimes = self.runtimes.write().await;
        if let Some(runtime) = runtimes.get(&account.id) {
            runtime.set_account(account);
            return runtime.clone();
        }
        debug!(account = %account.id, "creating runtime");
        let id = account.id.clone();
        let runtime = ConnectionRuntime::new(
            account,
            self.options.connector.clone(),
            Some(self.events_tx.clone()),
            self.options.dispatcher.clone(),
        );
        runtimes.insert(id, runtime.clone());
        runtime
    }

    pub async fn get(&self, account_id: &str) -> Option<ConnectionRuntime> {
        self.runtimes.read().await.get(account_id).cloned()
    }

    /// Ensures and starts the account's runtime. Returns `None` for an
    /// account without endpoint or credentials.
    pub async fn start_account(&self, account: AccountDescriptor) -> Option<ConnectionRuntime> {
        info!(
            account = %account.id,
            enabled = account.enabled,
            configured = account.configured,
            "start account"
        );
        if !account.configured {
            warn!(account = %account.id, "skipped start: incomplete config");
            return None;
        }

        if self.options.probe {
            let client = self.http.clone();
            let probe_account = account.clone();
            tokio::spawn(async move {
                run_probe(&client, &probe_account).await;
            });
        }

        let runtime = self.ensure(account).await;
        if !runtime.is_running() {
            runtime.start();
        }
        Some(runtime)
    }

    /// Closes and forgets the account's runtime. Returns its final snapshot.
    pub async fn stop_account(&self, account_id: &str) -> Option<RuntimeSnapshot> {
        let runtime = self.runtimes.write().await.remove(account_id)?;
        runtime.close();
        info!(account = %account_id, "account stopped");
        Some(runtime.snapshot())
    }

    /// Resolves the account from the latest configuration and returns its
    /// runtime, starting it unless it was explicitly closed.
    pub async fn runtime_for(&self, account_id: &str) -> Result<ConnectionRuntime, RegistryError> {
        let account = {
            let config = self.config.read().await;
            resolve_account(&config, account_id)
        }
        .ok_or_else(|| RegistryError::UnknownAccount(account_id.to_string()))?;
        if !account.configured {
            return Err(RegistryError::NotConfigured(account_id.to_string()));
        }
        let runtime = self.ensure(account).await;
        runtime.ensure_started();
        Ok(runtime)
    }

    /// Sends a text reply (`message.recv`).
    pub async fn send_text(
        &self,
        account_id: &str,
        text: &str,
        msg_id: Option<String>,
        reply_to: Option<String>,
    ) -> Result<(), RegistryError> {
        let runtime = self.runtime_for(account_id).await?;
        runtime.send_event(
            EventName::MessageRecv,
            msg_id,
            &MessageRecvPayload::text(text, reply_to),
        );
        Ok(())
    }

    /// Sends a media reply (`message.recv` with attachments).
    pub async fn send_media(
        &self,
        account_id: &str,
        text: &str,
        attachments: Vec<Value>,
        msg_id: Option<String>,
    ) -> Result<(), RegistryError> {
        let runtime = self.runtime_for(account_id).await?;
        runtime.send_event(
            EventName::MessageRecv,
            msg_id,
            &MessageRecvPayload::media(text, attachments),
        );
        Ok(())
    }

    /// Sends a streaming fragment. Without an explicit `sequence` the
    /// runtime's next sequence number is used. Returns the sequence sent.
    pub async fn send_delta(
        &self,
        account_id: &str,
        delta: &str,
        is_final: bool,
        sequence: Option<u64>,
        msg_id: Option<String>,
    ) -> Result<u64, RegistryError> {
        let runtime = self.runtime_for(account_id).await?;
        let sequence = sequence.unwrap_or_else(|| runtime.next_seq());
        runtime.send_event(
            EventName::MessageDelta,
            msg_id,
            &MessageDeltaPayload {
                delta: delta.to_string(),
                is_final,
                sequence,
            },
        );
        Ok(sequence)
    }

    /// Snapshots of every runtime, ordered by account id.
    pub async fn snapshots(&self) -> Vec<RuntimeSnapshot> {
        let mut snapshots: Vec<RuntimeSnapshot> = self
            .runtimes
            .read()
            .await
            .values()
            .map(ConnectionRuntime::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        snapshots
    }

    /// Closes and removes every runtime.
    pub async fn shutdown(&self) {
        let runtimes: Vec<ConnectionRuntime> =
            self.runtimes.write().await.drain().map(|(_, r)| r).collect();
        for runtime in &runtimes {
            runtime.close();
        }
        info!(count = runtimes.len(), "all accounts stopped");
    }

    /// Supervises one account until `cancel` fires.
    ///
    /// A missing or disabled account reports `disabled`, an incomplete one
    /// `not configured`, and both return immediately. Otherwise the account
    /// is started, its status published every `status_interval`, and on
    /// cancellation the runtime is closed and a final status published.
    pub async fn run_account<F>(
        &self,
        config: Value,
        account_id: &str,
        cancel: CancellationToken,
        mut set_status: F,
    ) where
        F: FnMut(AccountStatus) + Send,
    {
        let account = resolve_account(&config, account_id);
        self.set_config(config).await;

        let account = match account {
            Some(account) if account.enabled => account,
            other => {
                let configured = other.is_some_and(|a| a.configured);
                set_status(AccountStatus::idle(
                    account_id,
                    false,
                    configured,
                    Some(STATUS_DISABLED.into()),
                ));
                return;
            }
        };
        if !account.configured {
            set_status(AccountStatus::idle(
                account_id,
                true,
                false,
                Some(STATUS_NOT_CONFIGURED.into()),
            ));
            return;
        }

        let Some(runtime) = self.start_account(account).await else {
            return;
        };
        set_status(AccountStatus::from_snapshot(true, true, runtime.snapshot()));

        let mut ticker = tokio::time::interval(self.options.status_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    set_status(AccountStatus::from_snapshot(true, true, runtime.snapshot()));
                }
            }
        }

        let current = self.get(account_id).await;
        if let Some(current) = &current {
            current.close();
        }
        let snapshot = current.unwrap_or(runtime).snapshot();
        set_status(AccountStatus::from_snapshot(true, true, snapshot));
        info!(account = %account_id, "stop requested");
    }
}
