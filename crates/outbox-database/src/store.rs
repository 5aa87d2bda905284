//! Async facade over the outbox queries.
//!
//! `OutboxStore` owns an [`AsyncDatabase`] and a [`Clock`]; every method that
//! needs "now" reads it from the clock, so tests can drive lease expiry and
//! backoff deadlines with a `ManualClock`.

use crate::{
    queries, AsyncDatabase, Clock, DatabaseResult, FailureOutcome, MessageId, NewOutboxMessage,
    OutboxMessage, OutboxStats, SystemClock,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Persistent outbox backed by SQLite.
#[derive(Clone)]
pub struct OutboxStore {
    db: AsyncDatabase,
    clock: Arc<dyn Clock>,
}

impl OutboxStore {
    pub fn new(db: AsyncDatabase) -> Self {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: AsyncDatabase, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn db(&self) -> &AsyncDatabase {
        &self.db
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Append a message in its own transaction.
    ///
    /// Use [`OutboxStore::write_with_messages`] when the message accompanies
    /// a domain change.
    pub async fn append(&self, message: NewOutboxMessage) -> DatabaseResult<OutboxMessage> {
        let now = self.now();
        self.db
            .transaction(move |tx| queries::append_message(tx, &message, now))
            .await
    }

    /// Run a domain write and append the messages it produces in the same
    /// transaction.
    ///
    /// If `f` fails nothing is written, neither the domain rows nor the
    /// messages.
    pub async fn write_with_messages<F, T>(&self, f: F) -> DatabaseResult<(T, Vec<OutboxMessage>)>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> DatabaseResult<(T, Vec<NewOutboxMessage>)>
            + Send
            + 'static,
        T: Send + 'static,
    {
        let now = self.now();
        self.db
            .transaction(move |tx| {
                let (value, messages) = f(tx)?;
                let appended = messages
                    .iter()
                    .map(|message| queries::append_message(tx, message, now))
                    .collect::<DatabaseResult<Vec<_>>>()?;
                Ok((value, appended))
            })
            .await
    }

    pub async fn get(&self, id: &MessageId) -> DatabaseResult<Option<OutboxMessage>> {
        let id = id.clone();
        self.db.call(move |conn| queries::get_message(conn, &id)).await
    }

    pub async fn select_due(&self, batch_size: usize) -> DatabaseResult<Vec<OutboxMessage>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let now = self.now();
        self.db
            .call(move |conn| queries::select_due(conn, batch_size, now))
            .await
    }

    /// Lease up to `batch_size` claimable messages to `worker_id`.
    pub async fn claim_due(
        &self,
        worker_id: &str,
        batch_size: usize,
        lease: chrono::Duration,
    ) -> DatabaseResult<Vec<OutboxMessage>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let now = self.now();
        let worker_id = worker_id.to_string();
        self.db
            .transaction(move |tx| queries::claim_due(tx, &worker_id, batch_size, now, lease))
            .await
    }

    pub async fn release_claim(&self, id: &MessageId, worker_id: &str) -> DatabaseResult<bool> {
        let id = id.clone();
        let worker_id = worker_id.to_string();
        self.db
            .call(move |conn| queries::release_claim(conn, &id, &worker_id))
            .await
    }

    pub async fn mark_processed(&self, id: &MessageId) -> DatabaseResult<bool> {
        let id = id.clone();
        let now = self.now();
        self.db
            .call(move |conn| queries::mark_processed(conn, &id, now))
            .await
    }

    pub async fn mark_failed(
        &self,
        id: &MessageId,
        worker_id: &str,
        error: &str,
    ) -> DatabaseResult<Option<u32>> {
        let id = id.clone();
        let worker_id = worker_id.to_string();
        let error = error.to_string();
        let now = self.now();
        self.db
            .call(move |conn| queries::mark_failed(conn, &id, &worker_id, &error, now))
            .await
    }

    pub async fn reschedule(&self, id: &MessageId, at: DateTime<Utc>) -> DatabaseResult<bool> {
        let id = id.clone();
        self.db
            .call(move |conn| queries::reschedule(conn, &id, at))
            .await
    }

    pub async fn dead_letter(&self, id: &MessageId, worker_id: &str) -> DatabaseResult<bool> {
        let id = id.clone();
        let worker_id = worker_id.to_string();
        let now = self.now();
        self.db
            .call(move |conn| queries::dead_letter(conn, &id, &worker_id, now))
            .await
    }

    /// Record a failed attempt and its follow-up in one transaction.
    pub async fn record_failure(
        &self,
        id: &MessageId,
        worker_id: &str,
        error: &str,
        outcome: FailureOutcome,
    ) -> DatabaseResult<Option<u32>> {
        let id = id.clone();
        let worker_id = worker_id.to_string();
        let error = error.to_string();
        let now = self.now();
        self.db
            .transaction(move |tx| {
                queries::record_failure(tx, &id, &worker_id, &error, outcome, now)
            })
            .await
    }

    pub async fn delete_processed(&self, cutoff: DateTime<Utc>) -> DatabaseResult<usize> {
        self.db
            .call(move |conn| queries::delete_processed(conn, cutoff))
            .await
    }

    pub async fn stats(&self) -> DatabaseResult<OutboxStats> {
        let now = self.now();
        self.db.call(move |conn| queries::outbox_stats(conn, now)).await
    }

    pub async fn list_dead_lettered(&self, limit: usize) -> DatabaseResult<Vec<OutboxMessage>> {
        self.db
            .call(move |conn| queries::list_dead_lettered(conn, limit))
            .await
    }
}
