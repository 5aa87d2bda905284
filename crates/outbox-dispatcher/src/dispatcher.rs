//! Polling dispatcher.
//!
//! Each cycle leases a batch of due messages, invokes their handlers with
//! bounded concurrency and records one outcome per message. No state is kept
//! between cycles; every decision is derived from the persisted row and the
//! store's clock.

use crate::{DispatchError, DispatchResult, HandlerError, HandlerRegistry, RetryPolicy};
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use outbox_database::{FailureOutcome, OutboxMessage, OutboxStore};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound for lease and backoff durations, so deadlines stay far from
/// the end of the representable timestamp range.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Lease owner written to `claimed_by`.
    pub worker_id: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Maximum handler invocations in flight within one cycle.
    pub max_concurrency: usize,
    pub handler_timeout: Duration,
    /// Must outlive `handler_timeout` so a lease never expires mid-invocation.
    pub lease_duration: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            max_concurrency: 8,
            handler_timeout: Duration::from_secs(30),
            lease_duration: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> DispatchResult<()> {
        if self.worker_id.is_empty() {
            return Err(DispatchError::InvalidConfig("worker_id must not be empty".into()));
        }
        if self.max_concurrency == 0 {
            return Err(DispatchError::InvalidConfig(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(DispatchError::InvalidConfig(
                "poll_interval must be positive".into(),
            ));
        }
        if self.lease_duration <= self.handler_timeout {
            return Err(DispatchError::InvalidConfig(format!(
                "lease_duration ({:?}) must exceed handler_timeout ({:?})",
                self.lease_duration, self.handler_timeout
            )));
        }
        if self.lease_duration > MAX_DELAY {
            return Err(DispatchError::InvalidConfig(format!(
                "lease_duration ({:?}) must not exceed {:?}",
                self.lease_duration, MAX_DELAY
            )));
        }
        if self.retry.backoff_max > MAX_DELAY {
            return Err(DispatchError::InvalidConfig(format!(
                "backoff_max ({:?}) must not exceed {:?}",
                self.retry.backoff_max, MAX_DELAY
            )));
        }
        Ok(())
    }
}

/// What happened to one claimed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Processed,
    /// Failure recorded; the message will be retried.
    Failed,
    DeadLettered,
    /// Lease dropped without an outcome.
    Released,
    /// The row was gone or already processed when the outcome was written.
    Skipped,
    /// The outcome write failed; the lease will expire and the message is
    /// reclaimed.
    WriteError,
}

/// Tally of one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub processed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub released: usize,
    pub skipped: usize,
    pub write_errors: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Processed => self.processed += 1,
            MessageOutcome::Failed => self.failed += 1,
            MessageOutcome::DeadLettered => self.dead_lettered += 1,
            MessageOutcome::Released => self.released += 1,
            MessageOutcome::Skipped => self.skipped += 1,
            MessageOutcome::WriteError => self.write_errors += 1,
        }
    }
}

/// Delivers due outbox messages to their handlers.
#[derive(Clone)]
pub struct Dispatcher {
    store: OutboxStore,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
    lease: chrono::Duration,
}

impl Dispatcher {
    pub fn new(
        store: OutboxStore,
        registry: Arc<HandlerRegistry>,
        config: DispatcherConfig,
    ) -> DispatchResult<Self> {
        config.validate()?;
        let lease = chrono::Duration::from_std(config.lease_duration)
            .map_err(|e| DispatchError::InvalidConfig(format!("lease_duration: {e}")))?;

        Ok(Self {
            store,
            registry,
            config,
            lease,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run one dispatch cycle.
    ///
    /// Returns `Err` only if the batch could not be claimed; per-message
    /// failures are recorded and counted in the report.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> DispatchResult<CycleReport> {
        let mut report = CycleReport::default();
        if shutdown.is_cancelled() {
            return Ok(report);
        }

        let batch = self
            .store
            .claim_due(&self.config.worker_id, self.config.batch_size, self.lease)
            .await?;
        report.claimed = batch.len();
        if batch.is_empty() {
            return Ok(report);
        }

        let deliveries: Vec<_> = batch
            .into_iter()
            .map(|message| self.process(message, shutdown))
            .collect();
        let outcomes: Vec<MessageOutcome> = stream::iter(deliveries)
            .buffer_unordered(self.config.max_concurrency)
            .collect()
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }

        info!(
            worker_id = %self.config.worker_id,
            claimed = report.claimed,
            processed = report.processed,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            released = report.released,
            "Dispatch cycle complete"
        );
        Ok(report)
    }

    async fn process(&self, message: OutboxMessage, shutdown: &CancellationToken) -> MessageOutcome {
        if shutdown.is_cancelled() {
            return self.release(&message).await;
        }

        let result = AssertUnwindSafe(self.invoke(&message, shutdown))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));

        match result {
            Ok(()) => self.complete(&message).await,
            Err(HandlerError::Cancelled) => {
                debug!(message_id = %message.id, "Handler cancelled, releasing claim");
                self.release(&message).await
            }
            Err(e) => self.fail(&message, e).await,
        }
    }

    async fn invoke(&self, message: &OutboxMessage, shutdown: &CancellationToken) -> Result<(), HandlerError> {
        let handler = self
            .registry
            .resolve(&message.message_type)
            .ok_or_else(|| HandlerError::UnknownType(message.message_type.clone()))?;

        let timeout = self.config.handler_timeout;
        match tokio::time::timeout(timeout, handler.handle(&message.content, shutdown.child_token())).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::TimedOut(timeout.as_millis())),
        }
    }

    async fn complete(&self, message: &OutboxMessage) -> MessageOutcome {
        match self.store.mark_processed(&message.id).await {
            Ok(true) => {
                debug!(message_id = %message.id, message_type = %message.message_type, "Message processed");
                MessageOutcome::Processed
            }
            Ok(false) => {
                debug!(message_id = %message.id, "Message already processed or removed");
                MessageOutcome::Skipped
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to mark message processed");
                MessageOutcome::WriteError
            }
        }
    }

    async fn fail(&self, message: &OutboxMessage, failure: HandlerError) -> MessageOutcome {
        let attempt = message.retry_count.saturating_add(1);
        let outcome = self.config.retry.on_failure(attempt, self.store.now());
        let error_text = failure.to_string();

        match self
            .store
            .record_failure(&message.id, &self.config.worker_id, &error_text, outcome).await {
            Ok(Some(retry_count)) => {
                if outcome == FailureOutcome::DeadLetter {
                    error!(
                        message_id = %message.id,
                        message_type = %message.message_type,
                        retry_count,
                        error = %error_text,
                        "Message dead-lettered"
                    );
                    MessageOutcome::DeadLettered
                } else {
                    warn!(
                        message_id = %message.id,
                        message_type = %message.message_type,
                        retry_count,
                        error = %error_text,
                        "Handler failed, will retry"
                    );
                    MessageOutcome::Failed
                }
            }
            Ok(None) => {
                debug!(message_id = %message.id, "Message already processed or removed");
                MessageOutcome::Skipped
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to record message failure");
                MessageOutcome::WriteError
            }
        }
    }

    async fn release(&self, message: &OutboxMessage) -> MessageOutcome {
        match self.store.release_claim(&message.id, &self.config.worker_id).await {
            Ok(_) => MessageOutcome::Released,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Failed to release claim");
                MessageOutcome::WriteError
            }
        }
    }

    /// Poll until `shutdown` is cancelled.
    ///
    /// A cycle that claims a full batch is followed immediately by another
    /// one instead of waiting for the next tick.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            handlers = ?self.registry.types(),
            "Dispatcher started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            loop {
                match self.run_cycle(&shutdown).await {
                    Ok(report) => {
                        let full_batch =
                            self.config.batch_size > 0 && report.claimed >= self.config.batch_size;
                        if !full_batch || shutdown.is_cancelled() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(worker_id = %self.config.worker_id, error = %e, "Dispatch cycle failed");
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "Dispatcher stopped");
    }

    /// Spawn [`Dispatcher::run`] onto the runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            worker_id: "test-worker".into(),
            ..DispatcherConfig::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(DispatcherConfig::default().validate().is_ok());
        assert!(DispatcherConfig::default().worker_id.starts_with("worker-"));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let cfg = DispatcherConfig {
            max_concurrency: 0,
            ..config()
        };
        assert!(matches!(cfg.validate(), Err(DispatchError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let cfg = DispatcherConfig {
            poll_interval: Duration::ZERO,
            ..config()
        };
        assert!(matches!(cfg.validate(), Err(DispatchError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_short_lease() {
        let cfg = DispatcherConfig {
            handler_timeout: Duration::from_secs(60),
            lease_duration: Duration::from_secs(60),
            ..config()
        };
        assert!(matches!(cfg.validate(), Err(DispatchError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_unbounded_delays() {
        let long_lease = DispatcherConfig {
            lease_duration: Duration::from_secs(u64::MAX),
            ..config()
        };
        assert!(matches!(long_lease.validate(), Err(DispatchError::InvalidConfig(_))));

        let mut long_backoff = config();
        long_backoff.retry.backoff_max = MAX_DELAY + Duration::from_secs(1);
        assert!(matches!(long_backoff.validate(), Err(DispatchError::InvalidConfig(_))));

        let mut at_limit = config();
        at_limit.lease_duration = MAX_DELAY;
        at_limit.retry.backoff_max = MAX_DELAY;
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let literal: Box<dyn Any + Send> = Box::new("index out of bounds");
        assert_eq!(panic_message(literal.as_ref()), "index out of bounds");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bad state"));
        assert_eq!(panic_message(owned.as_ref()), "bad state");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_cycle_report_tally() {
        let mut report = CycleReport::default();
        for outcome in [
            MessageOutcome::Processed,
            MessageOutcome::Processed,
            MessageOutcome::Failed,
            MessageOutcome::DeadLettered,
            MessageOutcome::Released,
            MessageOutcome::WriteError,
        ] {
            report.record(outcome);
        }
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.released, 1);
        assert_eq!(report.write_errors, 1);
    }
}
