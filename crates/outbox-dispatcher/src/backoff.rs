//! Retry policy for failed deliveries.
//!
//! Retry delay follows exponential backoff: `base * 2^(attempt - 1)` capped at
//! `backoff_max`. With the defaults:
//! - 1st failure: retry in 2s
//! - 2nd failure: 4s
//! - 3rd failure: 8s
//! - ... up to 300s
//!
//! After `max_attempts` consecutive failures the message is dead-lettered.

use chrono::{DateTime, Utc};
use outbox_database::FailureOutcome;
use std::time::Duration;

/// How failed messages are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Failures allowed before dead-lettering. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            max_attempts: Some(10),
        }
    }
}

impl RetryPolicy {
    /// Retries forever with capped backoff.
    pub fn unlimited(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            backoff_base,
            backoff_max,
            max_attempts: None,
        }
    }

    /// Decide what to persist after the `attempt`-th consecutive failure.
    ///
    /// `attempt` is the retry count the message will have once this failure
    /// is recorded.
    pub fn on_failure(&self, attempt: u32, now: DateTime<Utc>) -> FailureOutcome {
        if self.is_exhausted(attempt) {
            return FailureOutcome::DeadLetter;
        }

        let delay = self.backoff(attempt);
        if delay.is_zero() {
            FailureOutcome::RetryImmediately
        } else {
            FailureOutcome::RetryAt(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
        }
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }

    pub fn backoff(&self, attempt: u32) -> chrono::Duration {
        compute_backoff(attempt, self.backoff_base, self.backoff_max)
    }
}

/// `base * 2^(attempt - 1)` capped at `max`; zero for attempt 0.
pub fn compute_backoff(attempt: u32, base: Duration, max: Duration) -> chrono::Duration {
    if attempt == 0 {
        return chrono::Duration::zero();
    }

    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    let multiplier = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);

    chrono::Duration::milliseconds(delay_ms.min(i64::MAX as u64) as i64)
}
