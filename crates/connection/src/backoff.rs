//! Reconnect delay calculation.

use std::time::Duration;

use rand::Rng;

use cloudlink_account::AccountDescriptor;

/// Exponential backoff with a cap and symmetric jitter.
///
/// `base(n) = min(max, initial * factor^(n-1))`; with jitter `j > 0` the
/// delay is drawn uniformly from `[base*(1-j), base*(1+j))`, floored at 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn from_account(account: &AccountDescriptor) -> Self {
        Self {
            initial_ms: account.reconnect_initial_ms,
            max_ms: account.reconnect_max_ms,
            factor: account.reconnect_factor,
            jitter: account.reconnect_jitter,
        }
    }

    /// Un-jittered delay for a 1-based attempt; `0` is treated as `1`.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.max(1).saturating_sub(1).min(1023) as i32;
        let growth = self.initial_ms as f64 * self.factor.powi(exp);
        let capped = growth.min(self.max_ms as f64);
        if capped.is_finite() {
            capped.max(0.0) as u64
        } else {
            self.max_ms
        }
    }

    /// Jittered delay using the thread-local RNG.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.delay_ms_with(attempt, &mut rand::thread_rng())
    }

    /// Jittered delay using the given RNG.
    pub fn delay_ms_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> u64 {
        let base = self.base_delay_ms(attempt);
        if self.jitter <= 0.0 || base == 0 {
            return base;
        }
        let span = base as f64 * self.jitter;
        let lo = (base as f64 - span).max(0.0);
        let hi = base as f64 + span;
        (lo + rng.r#gen::<f64>() * (hi - lo)).floor() as u64
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }
}
