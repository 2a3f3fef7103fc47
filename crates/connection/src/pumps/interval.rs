//! Periodic timer task.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Calls `on_tick` every `period` until cancelled or `on_tick` returns
/// `false`. The first call happens one full period after start.
pub(crate) async fn tick_every<F>(period: Duration, cancel: CancellationToken, mut on_tick: F)
where
    F: FnMut() -> bool,
{
    if period.is_zero() {
        debug!("zero timer period, timer not started");
        return;
    }
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if !on_tick() {
                    break;
                }
            }
        }
    }
}
