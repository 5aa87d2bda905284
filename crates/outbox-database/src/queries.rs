//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter. A
//! `rusqlite::Transaction` derefs to `Connection`, so the writer functions
//! compose with whatever transaction the caller already holds.

use crate::models::{format_timestamp, OutboxMessageRow};
use crate::{
    DatabaseError, DatabaseResult, FailureOutcome, MessageId, NewOutboxMessage, OutboxMessage,
    OutboxStats,
};
use chrono::{DateTime, Utc};
use rusqlite::{named_params, params, Connection, OptionalExtension, Row};
use tracing::debug;

const MESSAGE_COLUMNS: &str = "id, message_type, content, created_at, scheduled_at, processed_at, error, retry_count, claimed_by, claimed_until, dead_lettered_at";

/// Shared WHERE clause for claimable rows; `?1` is `now`.
const CLAIMABLE: &str = "processed_at IS NULL
           AND dead_lettered_at IS NULL
           AND scheduled_at <= ?1
           AND (claimed_until IS NULL OR claimed_until <= ?1)";

/// Clears the lease unless a different worker still holds it live. Binds
/// `:worker` and `:now`; SET expressions read the pre-update row.
const RELEASE_OWN_LEASE: &str = "claimed_by = CASE
               WHEN claimed_by = :worker OR claimed_until IS NULL OR claimed_until <= :now THEN NULL
               ELSE claimed_by END,
           claimed_until = CASE
               WHEN claimed_by = :worker OR claimed_until IS NULL OR claimed_until <= :now THEN NULL
               ELSE claimed_until END";

/// SQLite treats a negative LIMIT as unlimited, so clamp instead of wrapping.
fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// ==========================================
// Writer
// ==========================================

/// Append a message to the outbox.
///
/// Call this with the same transaction that carries the domain change: the
/// row becomes durable exactly when that transaction commits.
pub fn append_message(
    conn: &Connection,
    message: &NewOutboxMessage,
    now: DateTime<Utc>,
) -> DatabaseResult<OutboxMessage> {
    let created_at = format_timestamp(now);
    let scheduled_at = message
        .scheduled_at
        .map(format_timestamp)
        .unwrap_or_else(|| created_at.clone());

    conn.execute(
        "INSERT INTO outbox_messages (id, message_type, content, created_at, scheduled_at, retry_count)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        params![
            message.id.as_str(),
            message.message_type,
            message.content,
            created_at,
            scheduled_at,
        ],
    )?;
    debug!(message_id = %message.id, message_type = %message.message_type, "Appended outbox message");

    get_message(conn, &message.id)?
        .ok_or_else(|| DatabaseError::NotFound("Outbox message not found after insert".to_string()))
}

// ==========================================
// Reads
// ==========================================

/// Get a message by ID.
pub fn get_message(conn: &Connection, id: &MessageId) -> DatabaseResult<Option<OutboxMessage>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM outbox_messages WHERE id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    let row = stmt.query_row(params![id.as_str()], map_row).optional()?;
    row.map(OutboxMessage::try_from).transpose()
}

/// Select up to `batch_size` claimable messages, oldest-due first.
///
/// Read-only: nothing is leased. Use [`claim_due`] to take ownership.
pub fn select_due(
    conn: &Connection,
    batch_size: usize,
    now: DateTime<Utc>,
) -> DatabaseResult<Vec<OutboxMessage>> {
    if batch_size == 0 {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM outbox_messages
         WHERE {CLAIMABLE}
         ORDER BY scheduled_at ASC, created_at ASC, id ASC
         LIMIT ?2"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params![format_timestamp(now), sql_limit(batch_size)], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    into_messages(rows)
}

/// List dead-lettered messages, oldest first.
pub fn list_dead_lettered(conn: &Connection, limit: usize) -> DatabaseResult<Vec<OutboxMessage>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM outbox_messages
         WHERE dead_lettered_at IS NOT NULL AND processed_at IS NULL
         ORDER BY dead_lettered_at ASC, id ASC
         LIMIT ?1"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params![sql_limit(limit)], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    into_messages(rows)
}

/// Count rows per lifecycle state at `now`.
pub fn outbox_stats(conn: &Connection, now: DateTime<Utc>) -> DatabaseResult<OutboxStats> {
    let stats = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN processed_at IS NULL AND dead_lettered_at IS NULL
                               AND (claimed_until IS NULL OR claimed_until <= ?1) THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN processed_at IS NULL AND dead_lettered_at IS NULL
                               AND (claimed_until IS NULL OR claimed_until <= ?1)
                               AND scheduled_at <= ?1 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN processed_at IS NULL AND claimed_until > ?1 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN processed_at IS NOT NULL THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN processed_at IS NULL AND dead_lettered_at IS NOT NULL THEN 1 ELSE 0 END), 0)
         FROM outbox_messages",
        params![format_timestamp(now)],
        |row| {
            Ok(OutboxStats {
                pending: row.get::<_, i64>(0)? as u64,
                due: row.get::<_, i64>(1)? as u64,
                leased: row.get::<_, i64>(2)? as u64,
                processed: row.get::<_, i64>(3)? as u64,
                dead_lettered: row.get::<_, i64>(4)? as u64,
            })
        },
    )?;
    Ok(stats)
}

// ==========================================
// Claiming
// ==========================================

/// Lease up to `batch_size` claimable messages to `worker_id` until `now + lease`.
///
/// Selection and stamping happen in one UPDATE statement, so two workers can
/// never lease the same row at the same time. Results are ordered oldest-due
/// first.
pub fn claim_due(
    conn: &Connection,
    worker_id: &str,
    batch_size: usize,
    now: DateTime<Utc>,
    lease: chrono::Duration,
) -> DatabaseResult<Vec<OutboxMessage>> {
    if batch_size == 0 {
        return Ok(Vec::new());
    }

    let claimed_until = now
        .checked_add_signed(lease)
        .ok_or_else(|| DatabaseError::InvalidData(format!("lease {lease} overflows the clock")))?;

    let sql = format!(
        "UPDATE outbox_messages
         SET claimed_by = ?3, claimed_until = ?4
         WHERE id IN (
             SELECT id FROM outbox_messages
             WHERE {CLAIMABLE}
             ORDER BY scheduled_at ASC, created_at ASC, id ASC
             LIMIT ?2
         )
         RETURNING {MESSAGE_COLUMNS}"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(
            params![
                format_timestamp(now),
                sql_limit(batch_size),
                worker_id,
                format_timestamp(claimed_until),
            ],
            map_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    // RETURNING does not preserve the subquery order.
    let mut messages = into_messages(rows)?;
    messages.sort_by(|a, b| {
        a.scheduled_at
            .cmp(&b.scheduled_at)
            .then(a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.as_str().cmp(b.id.as_str()))
    });

    if !messages.is_empty() {
        debug!(worker_id, count = messages.len(), "Claimed outbox messages");
    }
    Ok(messages)
}

/// Drop a lease held by `worker_id` without recording an outcome.
pub fn release_claim(conn: &Connection, id: &MessageId, worker_id: &str) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_messages
         SET claimed_by = NULL, claimed_until = NULL
         WHERE id = ?1 AND claimed_by = ?2 AND processed_at IS NULL",
        params![id.as_str(), worker_id],
    )?;
    Ok(count > 0)
}

// ==========================================
// Outcomes
// ==========================================

/// Mark a message as delivered.
///
/// Sets `processed_at`, clears `error` and the lease, leaves `retry_count`
/// alone. Returns false if the message is missing or already processed.
pub fn mark_processed(conn: &Connection, id: &MessageId, now: DateTime<Utc>) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_messages
         SET processed_at = ?2, error = NULL, claimed_by = NULL, claimed_until = NULL
         WHERE id = ?1 AND processed_at IS NULL",
        params![id.as_str(), format_timestamp(now)],
    )?;
    Ok(count > 0)
}

/// Record a failed attempt reported by `worker_id`.
///
/// Overwrites `error` and increments `retry_count` by one. The lease is
/// cleared when `worker_id` holds it or it has expired; a live lease taken
/// over by another worker is left alone. Returns the new retry count, or
/// `None` if the message is missing or already processed.
pub fn mark_failed(
    conn: &Connection,
    id: &MessageId,
    worker_id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<Option<u32>> {
    let sql = format!(
        "UPDATE outbox_messages
         SET error = :error, retry_count = retry_count + 1, {RELEASE_OWN_LEASE}
         WHERE id = :id AND processed_at IS NULL
         RETURNING retry_count"
    );
    let retry_count: Option<i64> = conn
        .query_row(
            &sql,
            named_params! {
                ":id": id.as_str(),
                ":error": error,
                ":worker": worker_id,
                ":now": format_timestamp(now),
            },
            |row| row.get(0),
        )
        .optional()?;

    retry_count
        .map(|n| {
            u32::try_from(n)
                .map_err(|_| DatabaseError::InvalidData(format!("retry_count {n} out of range")))
        })
        .transpose()
}

/// Move `scheduled_at` of an unprocessed message. Touches nothing else.
pub fn reschedule(conn: &Connection, id: &MessageId, at: DateTime<Utc>) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_messages SET scheduled_at = ?2 WHERE id = ?1 AND processed_at IS NULL",
        params![id.as_str(), format_timestamp(at)],
    )?;
    Ok(count > 0)
}

/// Set an unprocessed message aside from automatic retries.
///
/// Lease handling matches [`mark_failed`].
pub fn dead_letter(
    conn: &Connection,
    id: &MessageId,
    worker_id: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let sql = format!(
        "UPDATE outbox_messages
         SET dead_lettered_at = :now, {RELEASE_OWN_LEASE}
         WHERE id = :id AND processed_at IS NULL AND dead_lettered_at IS NULL"
    );
    let count = conn.execute(
        &sql,
        named_params! {
            ":id": id.as_str(),
            ":worker": worker_id,
            ":now": format_timestamp(now),
        },
    )?;
    Ok(count > 0)
}

/// Record a failed attempt and apply its follow-up in one go.
///
/// Run this inside a transaction; `OutboxStore::record_failure` does.
pub fn record_failure(
    conn: &Connection,
    id: &MessageId,
    worker_id: &str,
    error: &str,
    outcome: FailureOutcome,
    now: DateTime<Utc>,
) -> DatabaseResult<Option<u32>> {
    let Some(retry_count) = mark_failed(conn, id, worker_id, error, now)? else {
        return Ok(None);
    };

    match outcome {
        FailureOutcome::RetryAt(at) => {
            reschedule(conn, id, at)?;
        }
        FailureOutcome::RetryImmediately => {}
        FailureOutcome::DeadLetter => {
            dead_letter(conn, id, worker_id, now)?;
        }
    }

    Ok(Some(retry_count))
}

// ==========================================
// Retention
// ==========================================

/// Delete processed messages whose `processed_at` is strictly before `cutoff`.
pub fn delete_processed(conn: &Connection, cutoff: DateTime<Utc>) -> DatabaseResult<usize> {
    let count = conn.execute(
        "DELETE FROM outbox_messages WHERE processed_at IS NOT NULL AND processed_at < ?1",
        params![format_timestamp(cutoff)],
    )?;
    Ok(count)
}

// ==========================================
// Row mapping
// ==========================================

fn map_row(row: &Row<'_>) -> rusqlite::Result<OutboxMessageRow> {
    Ok(OutboxMessageRow {
        id: row.get(0)?,
        message_type: row.get(1)?,
        content: row.get(2)?,
        created_at: row.get(3)?,
        scheduled_at: row.get(4)?,
        processed_at: row.get(5)?,
        error: row.get(6)?,
        retry_count: row.get(7)?,
        claimed_by: row.get(8)?,
        claimed_until: row.get(9)?,
        dead_lettered_at: row.get(10)?,
    })
}

fn into_messages(rows: Vec<OutboxMessageRow>) -> DatabaseResult<Vec<OutboxMessage>> {
    rows.into_iter().map(OutboxMessage::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{run_migrations, MessageState};
    use chrono::Duration;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn append_at(conn: &Connection, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> OutboxMessage {
        let msg = NewOutboxMessage::new("cache.invalidate", "{}").scheduled_at(scheduled_at);
        append_message(conn, &msg, now).unwrap()
    }

    #[test]
    fn test_append_defaults_scheduled_at_to_created_at() {
        let conn = setup();
        let now = Utc::now();

        let msg = append_message(&conn, &NewOutboxMessage::new("search.index", "{\"a\":1}"), now)
            .unwrap();
        assert_eq!(msg.scheduled_at, msg.created_at);
        assert_eq!(msg.retry_count, 0);
        assert!(msg.processed_at.is_none());
        assert!(msg.error.is_none());
        assert_eq!(msg.content, "{\"a\":1}");
        assert!(msg.is_claimable(now));
    }

    #[test]
    fn test_append_is_atomic_with_enclosing_transaction() {
        let mut conn = setup();
        conn.execute_batch("CREATE TABLE accounts (id TEXT PRIMARY KEY, balance INTEGER)")
            .unwrap();
        let now = Utc::now();

        let rolled_back = NewOutboxMessage::new("notification.send", "{}");
        {
            let tx = conn.transaction().unwrap();
            tx.execute("INSERT INTO accounts VALUES ('a-1', 10)", []).unwrap();
            append_message(&tx, &rolled_back, now).unwrap();
            tx.rollback().unwrap();
        }
        assert!(get_message(&conn, &rolled_back.id).unwrap().is_none());
        let accounts: i64 = conn
            .query_row("SELECT COUNT(*) FROM accounts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(accounts, 0);

        let committed = NewOutboxMessage::new("notification.send", "{}");
        {
            let tx = conn.transaction().unwrap();
            tx.execute("INSERT INTO accounts VALUES ('a-2', 20)", []).unwrap();
            append_message(&tx, &committed, now).unwrap();
            tx.commit().unwrap();
        }
        assert!(get_message(&conn, &committed.id).unwrap().is_some());
    }

    #[test]
    fn test_select_due_zero_batch_is_empty() {
        let conn = setup();
        let now = Utc::now();
        append_at(&conn, now, now);
        assert!(select_due(&conn, 0, now).unwrap().is_empty());
    }

    #[test]
    fn test_select_due_orders_and_limits() {
        let conn = setup();
        let now = Utc::now();
        let ids: Vec<MessageId> = [5, 1, 4, 2, 3]
            .iter()
            .map(|mins| append_at(&conn, now - Duration::minutes(10 - mins), now).id)
            .collect();

        let batch = select_due(&conn, 3, now).unwrap();
        let got: Vec<&MessageId> = batch.iter().map(|m| &m.id).collect();
        // scheduled offsets 1, 2, 3 minutes after now-10m are the earliest
        assert_eq!(got, vec![&ids[1], &ids[3], &ids[4]]);
    }

    #[test]
    fn test_select_due_excludes_future_and_processed() {
        let conn = setup();
        let now = Utc::now();
        let future = append_at(&conn, now + Duration::hours(1), now);
        let done = append_at(&conn, now, now);
        mark_processed(&conn, &done.id, now).unwrap();

        assert!(select_due(&conn, 10, now).unwrap().is_empty());

        let later = now + Duration::hours(1) + Duration::seconds(1);
        let due = select_due(&conn, 10, later).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, future.id);
    }

    #[test]
    fn test_mark_processed_clears_error_keeps_retry_count() {
        let conn = setup();
        let now = Utc::now();
        let msg = append_at(&conn, now, now);

        assert_eq!(mark_failed(&conn, &msg.id, "w", "boom", now).unwrap(), Some(1));
        assert!(mark_processed(&conn, &msg.id, now).unwrap());

        let stored = get_message(&conn, &msg.id).unwrap().unwrap();
        assert!(stored.processed_at.is_some());
        assert!(stored.error.is_none());
        assert_eq!(stored.retry_count, 1);

        // Second call keeps the original timestamp
        assert!(!mark_processed(&conn, &msg.id, now + Duration::hours(1)).unwrap());
        let again = get_message(&conn, &msg.id).unwrap().unwrap();
        assert_eq!(again.processed_at, stored.processed_at);
    }

    #[test]
    fn test_outcome_writes_on_missing_id_are_noops() {
        let conn = setup();
        let missing = MessageId::from_string("missing");
        let now = Utc::now();

        assert!(!mark_processed(&conn, &missing, now).unwrap());
        assert_eq!(mark_failed(&conn, &missing, "w", "boom", now).unwrap(), None);
        assert!(!reschedule(&conn, &missing, now).unwrap());
        assert!(!dead_letter(&conn, &missing, "w", now).unwrap());
        assert!(!release_claim(&conn, &missing, "w").unwrap());
    }

    #[test]
    fn test_mark_failed_counts_every_call() {
        let conn = setup();
        let now = Utc::now();
        let msg = append_at(&conn, now, now);

        for (i, err) in ["first", "second", "third"].iter().enumerate() {
            assert_eq!(mark_failed(&conn, &msg.id, "w", err, now).unwrap(), Some(i as u32 + 1));
        }

        let stored = get_message(&conn, &msg.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.error.as_deref(), Some("third"));
        assert!(stored.processed_at.is_none());
    }

    #[test]
    fn test_mark_failed_ignores_processed_messages() {
        let conn = setup();
        let now = Utc::now();
        let msg = append_at(&conn, now, now);
        mark_processed(&conn, &msg.id, now).unwrap();

        assert_eq!(mark_failed(&conn, &msg.id, "w", "late", now).unwrap(), None);
        let stored = get_message(&conn, &msg.id).unwrap().unwrap();
        assert!(stored.error.is_none());
        assert_eq!(stored.retry_count, 0);
    }

    #[test]
    fn test_reschedule_only_moves_scheduled_at() {
        let conn = setup();
        let now = Utc::now();
        let msg = append_at(&conn, now, now);
        mark_failed(&conn, &msg.id, "w", "boom", now).unwrap();

        let at = now + Duration::seconds(30);
        assert!(reschedule(&conn, &msg.id, at).unwrap());

        let stored = get_message(&conn, &msg.id).unwrap().unwrap();
        assert_eq!(stored.scheduled_at, crate::parse_timestamp(&format_timestamp(at)).unwrap());
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_claim_due_leases_exclusively() {
        let conn = setup();
        let now = Utc::now();
        for i in 0..4 {
            append_at(&conn, now - Duration::seconds(10 - i), now);
        }
        let lease = Duration::seconds(60);

        let first = claim_due(&conn, "worker-a", 3, now, lease).unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.windows(2).all(|w| w[0].scheduled_at <= w[1].scheduled_at));
        assert!(first.iter().all(|m| m.claimed_by.as_deref() == Some("worker-a")));
        assert!(first.iter().all(|m| m.state(now) == MessageState::Claimed));

        let second = claim_due(&conn, "worker-b", 10, now, lease).unwrap();
        assert_eq!(second.len(), 1);
        assert!(first.iter().all(|m| m.id != second[0].id));

        // Leased rows are also hidden from the read-only selector
        assert!(select_due(&conn, 10, now).unwrap().is_empty());

        // After expiry everything is claimable again
        let after = now + lease + Duration::seconds(1);
        let reclaimed = claim_due(&conn, "worker-b", 10, after, lease).unwrap();
        assert_eq!(reclaimed.len(), 4);
    }

    #[test]
    fn test_outcome_writes_clear_lease() {
        let conn = setup();
        let now = Utc::now();
        let a = append_at(&conn, now, now);
        let b = append_at(&conn, now, now);
        let lease = Duration::seconds(60);
        claim_due(&conn, "w", 10, now, lease).unwrap();

        mark_processed(&conn, &a.id, now).unwrap();
        mark_failed(&conn, &b.id, "w", "boom", now).unwrap();

        for id in [&a.id, &b.id] {
            let stored = get_message(&conn, id).unwrap().unwrap();
            assert!(stored.claimed_by.is_none());
            assert!(stored.claimed_until.is_none());
        }
        // b is claimable again right away
        assert_eq!(select_due(&conn, 10, now).unwrap().len(), 1);
    }

    #[test]
    fn test_stale_failure_keeps_the_new_owners_lease() {
        let conn = setup();
        let t0 = Utc::now();
        let msg = append_at(&conn, t0, t0);
        let lease = Duration::seconds(30);

        assert_eq!(claim_due(&conn, "worker-a", 1, t0, lease).unwrap().len(), 1);
        let t1 = t0 + lease + Duration::seconds(1);
        assert_eq!(claim_due(&conn, "worker-b", 1, t1, lease).unwrap().len(), 1);

        // worker-a reports late, after its lease went to worker-b
        let retry_at = t1 + Duration::seconds(2);
        let count = record_failure(
            &conn,
            &msg.id,
            "worker-a",
            "late failure",
            FailureOutcome::RetryAt(retry_at),
            t1,
        )
        .unwrap();
        assert_eq!(count, Some(1));

        let stored = get_message(&conn, &msg.id).unwrap().unwrap();
        assert_eq!(stored.claimed_by.as_deref(), Some("worker-b"));
        assert_eq!(stored.error.as_deref(), Some("late failure"));

        let t2 = t1 + Duration::seconds(3);
        assert!(claim_due(&conn, "worker-c", 1, t2, lease).unwrap().is_empty());

        // the current owner's own failure does clear it
        record_failure(&conn, &msg.id, "worker-b", "again", FailureOutcome::RetryImmediately, t2)
            .unwrap();
        assert_eq!(claim_due(&conn, "worker-c", 1, t2, lease).unwrap().len(), 1);
    }

    #[test]
    fn test_stale_dead_letter_keeps_live_lease_but_clears_expired_one() {
        let conn = setup();
        let now = Utc::now();
        let live = append_at(&conn, now, now);
        claim_due(&conn, "owner", 1, now, Duration::seconds(60)).unwrap();
        let expired = append_at(&conn, now, now);
        claim_due(&conn, "gone", 1, now, Duration::seconds(5)).unwrap();

        let later = now + Duration::seconds(10);
        assert!(dead_letter(&conn, &live.id, "other", later).unwrap());
        assert!(dead_letter(&conn, &expired.id, "other", later).unwrap());

        let live = get_message(&conn, &live.id).unwrap().unwrap();
        assert_eq!(live.claimed_by.as_deref(), Some("owner"));
        let expired = get_message(&conn, &expired.id).unwrap().unwrap();
        assert!(expired.claimed_by.is_none());
        assert!(expired.claimed_until.is_none());
    }

    #[test]
    fn test_oversized_limits_are_clamped() {
        let conn = setup();
        let now = Utc::now();
        append_at(&conn, now, now);
        let dead = append_at(&conn, now, now);
        dead_letter(&conn, &dead.id, "w", now).unwrap();

        assert_eq!(select_due(&conn, usize::MAX, now).unwrap().len(), 1);
        assert_eq!(list_dead_lettered(&conn, usize::MAX).unwrap().len(), 1);
        assert_eq!(
            claim_due(&conn, "w", usize::MAX, now, Duration::seconds(60)).unwrap().len(),
            1
        );
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }

    #[test]
    fn test_claim_due_rejects_overflowing_lease() {
        let conn = setup();
        let now = Utc::now();
        append_at(&conn, now, now);

        let result = claim_due(&conn, "w", 1, now, Duration::MAX);
        assert!(matches!(result, Err(DatabaseError::InvalidData(_))));
        assert_eq!(select_due(&conn, 10, now).unwrap().len(), 1);
    }

    #[test]
    fn test_release_claim_requires_owner() {
        let conn = setup();
        let now = Utc::now();
        let msg = append_at(&conn, now, now);
        claim_due(&conn, "owner", 1, now, Duration::seconds(60)).unwrap();

        assert!(!release_claim(&conn, &msg.id, "intruder").unwrap());
        assert!(release_claim(&conn, &msg.id, "owner").unwrap());
        assert_eq!(select_due(&conn, 1, now).unwrap().len(), 1);
    }

    #[test]
    fn test_record_failure_dead_letters() {
        let conn = setup();
        let now = Utc::now();
        let msg = append_at(&conn, now, now);

        let count = record_failure(&conn, &msg.id, "w", "permanent", FailureOutcome::DeadLetter, now)
            .unwrap();
        assert_eq!(count, Some(1));

        let stored = get_message(&conn, &msg.id).unwrap().unwrap();
        assert!(stored.dead_lettered_at.is_some());
        assert_eq!(stored.state(now), MessageState::DeadLettered);
        assert!(select_due(&conn, 10, now + Duration::days(1)).unwrap().is_empty());
        assert_eq!(list_dead_lettered(&conn, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_record_failure_retry_at_reschedules() {
        let conn = setup();
        let now = Utc::now();
        let msg = append_at(&conn, now, now);
        let retry_at = now + Duration::seconds(4);

        record_failure(&conn, &msg.id, "w", "flaky", FailureOutcome::RetryAt(retry_at), now).unwrap();

        assert!(select_due(&conn, 10, now).unwrap().is_empty());
        assert_eq!(select_due(&conn, 10, retry_at).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_processed_respects_cutoff_and_is_idempotent() {
        let conn = setup();
        let now = Utc::now();
        let old = append_at(&conn, now, now);
        let recent = append_at(&conn, now, now);
        let pending = append_at(&conn, now, now);

        mark_processed(&conn, &old.id, now - Duration::days(10)).unwrap();
        mark_processed(&conn, &recent.id, now).unwrap();

        let cutoff = now - Duration::days(7);
        assert_eq!(delete_processed(&conn, cutoff).unwrap(), 1);
        assert_eq!(delete_processed(&conn, cutoff).unwrap(), 0);

        assert!(get_message(&conn, &old.id).unwrap().is_none());
        assert!(get_message(&conn, &recent.id).unwrap().is_some());
        assert!(get_message(&conn, &pending.id).unwrap().is_some());
    }

    #[test]
    fn test_delete_processed_keeps_row_at_exact_cutoff() {
        let conn = setup();
        let now = Utc::now();
        let msg = append_at(&conn, now, now);
        mark_processed(&conn, &msg.id, now).unwrap();

        let stored = get_message(&conn, &msg.id).unwrap().unwrap();
        let processed_at = stored.processed_at.unwrap();
        assert_eq!(delete_processed(&conn, processed_at).unwrap(), 0);
        assert_eq!(delete_processed(&conn, processed_at + Duration::microseconds(1)).unwrap(), 1);
    }

    #[test]
    fn test_outbox_stats() {
        let conn = setup();
        let now = Utc::now();
        append_at(&conn, now, now);
        append_at(&conn, now + Duration::hours(1), now);
        let leased = append_at(&conn, now - Duration::seconds(1), now);
        let processed = append_at(&conn, now, now);
        let dead = append_at(&conn, now, now);

        claim_due(&conn, "w", 1, now, Duration::seconds(60)).unwrap();
        mark_processed(&conn, &processed.id, now).unwrap();
        dead_letter(&conn, &dead.id, "w", now).unwrap();

        let stats = outbox_stats(&conn, now).unwrap();
        assert_eq!(
            stats,
            OutboxStats {
                pending: 2,
                due: 1,
                leased: 1,
                processed: 1,
                dead_lettered: 1,
            }
        );
        let leased_row = get_message(&conn, &leased.id).unwrap().unwrap();
        assert_eq!(leased_row.claimed_by.as_deref(), Some("w"));
    }
}
