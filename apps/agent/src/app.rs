//! Application orchestrator: supervises every configured account.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cloudlink_account::list_account_ids;
use cloudlink_connection::{
    AccountStatus, ConnectionState, DispatchError, InboundContext, RegistryOptions,
    ReplyDispatcher, ReplySink, RuntimeEvent, RuntimeRegistry,
};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Runs the agent until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let dispatcher: Option<Arc<dyn ReplyDispatcher>> = if config.agent.echo_replies {
        Some(Arc::new(EchoDispatcher))
    } else {
        None
    };
    let registry = Arc::new(RuntimeRegistry::new(
        config.channel.clone(),
        RegistryOptions {
            dispatcher,
            ..RegistryOptions::default()
        },
    ));

    if let Some(mut events) = registry.take_events().await {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_event(&event);
            }
        });
    }

    // -- Accounts --
    let ids = list_account_ids(&config.channel);
    if ids.is_empty() {
        tracing::warn!("no accounts configured");
    }
    let mut tasks = Vec::with_capacity(ids.len());
    for id in ids {
        let registry = Arc::clone(&registry);
        let channel = config.channel.clone();
        let cancel = cancel.child_token();
        tasks.push(tokio::spawn(async move {
            let mut last: Option<(ConnectionState, Option<String>)> = None;
            registry
                .run_account(channel, &id, cancel, move |status| {
                    report_status(&mut last, &status)
                })
                .await;
        }));
    }

    tracing::info!(accounts = tasks.len(), "agent ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");

    // -- Graceful shutdown --
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("account task failed: {e}");
        }
    }
    registry.shutdown().await;

    Ok(())
}

/// Logs a status only when its state or error changed.
fn report_status(last: &mut Option<(ConnectionState, Option<String>)>, status: &AccountStatus) {
    let current = (status.state, status.last_error.clone());
    if last.as_ref() == Some(&current) {
        return;
    }
    tracing::info!(
        account = %status.account_id,
        state = ?status.state,
        connected = status.connected,
        queue = status.queue_size,
        dropped = status.dropped_count,
        error = status.last_error.as_deref().unwrap_or(""),
        "account status"
    );
    *last = Some(current);
}

fn log_event(event: &RuntimeEvent) {
    match event {
        RuntimeEvent::StateChanged { account_id, state } => {
            tracing::debug!(account = %account_id, state = ?state, "state changed");
        }
        RuntimeEvent::Reconnecting {
            account_id,
            attempt,
            delay_ms,
            reason,
        } => {
            tracing::info!(account = %account_id, attempt, delay_ms, reason = %reason, "reconnecting");
        }
        RuntimeEvent::Fatal { account_id, error } => {
            tracing::error!(
                account = %account_id,
                error = %error,
                "account stopped, check its credentials and configuration"
            );
        }
    }
}

/// Replies to every inbound message with its body.
struct EchoDispatcher;

impl ReplyDispatcher for EchoDispatcher {
    fn dispatch(
        &self,
        ctx: InboundContext,
        sink: ReplySink,
    ) -> Pin<Box<dyn Future<Output = Result<bool, DispatchError>> + Send + '_>> {
        Box::pin(async move {
            if ctx.is_empty() {
                return Ok(false);
            }
            sink.finish(&ctx.body);
            Ok(true)
        })
    }
}
