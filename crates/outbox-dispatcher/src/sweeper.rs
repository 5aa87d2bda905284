//! Retention sweeper for processed messages.

use outbox_database::{DatabaseResult, OutboxStore};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deletes processed messages older than the retention period.
///
/// Unprocessed and dead-lettered rows are never touched.
#[derive(Clone)]
pub struct RetentionSweeper {
    store: OutboxStore,
    retention: chrono::Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(store: OutboxStore, retention: chrono::Duration, interval: Duration) -> Self {
        Self {
            store,
            retention,
            interval,
        }
    }

    /// Delete rows processed before `now - retention`. Returns the number removed.
    pub async fn sweep_once(&self) -> DatabaseResult<usize> {
        let Some(cutoff) = self.store.now().checked_sub_signed(self.retention) else {
            debug!(retention = %self.retention, "Retention reaches past the clock range, nothing to sweep");
            return Ok(0);
        };
        let deleted = self.store.delete_processed(cutoff).await?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Swept processed outbox messages");
        } else {
            debug!(cutoff = %cutoff, "Nothing to sweep");
        }
        Ok(deleted)
    }

    /// Sweep on every interval tick until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            retention_hours = self.retention.num_hours(),
            interval_secs = self.interval.as_secs(),
            "Retention sweeper started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }

        info!("Retention sweeper stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
