//! Database model types.

use crate::{DatabaseError, DatabaseResult, MessageId};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Outbox message - a durable record of a side effect that has not been
/// confirmed delivered yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    /// Discriminator naming the payload shape and the handler to invoke.
    pub message_type: String,
    /// Serialized payload, opaque to the store.
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Most recent failure description.
    pub error: Option<String>,
    pub retry_count: u32,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Derive the lifecycle state of this row at `now`.
    pub fn state(&self, now: DateTime<Utc>) -> MessageState {
        if self.processed_at.is_some() {
            MessageState::Processed
        } else if self.dead_lettered_at.is_some() {
            MessageState::DeadLettered
        } else if self.claimed_until.is_some_and(|until| until > now) {
            MessageState::Claimed
        } else {
            MessageState::Pending
        }
    }

    /// Whether a worker may claim this message at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == MessageState::Pending && self.scheduled_at <= now
    }
}

/// Observable lifecycle state of an outbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Waiting for delivery (possibly scheduled in the future).
    Pending,
    /// Held by a worker under an unexpired lease.
    Claimed,
    Processed,
    /// Retry policy exhausted; never claimed again.
    DeadLettered,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Processed => "processed",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// New outbox message for insertion.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub id: MessageId,
    pub message_type: String,
    pub content: String,
    /// `None` makes the message claimable as soon as it commits.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewOutboxMessage {
    pub fn new(message_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            message_type: message_type.into(),
            content: content.into(),
            scheduled_at: None,
        }
    }

    /// Build a message whose content is `payload` serialized as JSON.
    pub fn json<T: Serialize>(message_type: impl Into<String>, payload: &T) -> DatabaseResult<Self> {
        Ok(Self::new(message_type, serde_json::to_string(payload)?))
    }

    /// Defer eligibility until `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// What to persist alongside a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Leave the message pending and move `scheduled_at` to the given time.
    RetryAt(DateTime<Utc>),
    /// Leave the message pending without touching `scheduled_at`.
    RetryImmediately,
    /// Set the message aside from automatic retries.
    DeadLetter,
}

/// Row counts per lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    /// Unprocessed, not dead-lettered, not under an active lease.
    pub pending: u64,
    /// Subset of `pending` whose `scheduled_at` has passed.
    pub due: u64,
    /// Unprocessed rows held under an unexpired lease.
    pub leased: u64,
    pub processed: u64,
    pub dead_lettered: u64,
}

/// Raw column values; converted into [`OutboxMessage`] outside the row callback
/// so timestamp decoding errors surface as [`DatabaseError::InvalidData`].
#[derive(Debug)]
pub(crate) struct OutboxMessageRow {
    pub id: String,
    pub message_type: String,
    pub content: String,
    pub created_at: String,
    pub scheduled_at: String,
    pub processed_at: Option<String>,
    pub error: Option<String>,
    pub retry_count: i64,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<String>,
    pub dead_lettered_at: Option<String>,
}

impl TryFrom<OutboxMessageRow> for OutboxMessage {
    type Error = DatabaseError;

    fn try_from(row: OutboxMessageRow) -> DatabaseResult<Self> {
        let retry_count = u32::try_from(row.retry_count).map_err(|_| {
            DatabaseError::InvalidData(format!(
                "retry_count {} out of range for message {}",
                row.retry_count, row.id
            ))
        })?;

        Ok(Self {
            created_at: parse_timestamp(&row.created_at)?,
            scheduled_at: parse_timestamp(&row.scheduled_at)?,
            processed_at: row.processed_at.as_deref().map(parse_timestamp).transpose()?,
            claimed_until: row.claimed_until.as_deref().map(parse_timestamp).transpose()?,
            dead_lettered_at: row
                .dead_lettered_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            id: MessageId(row.id),
            message_type: row.message_type,
            content: row.content,
            error: row.error,
            retry_count,
            claimed_by: row.claimed_by,
        })
    }
}

/// Format a timestamp for storage.
///
/// Fixed-width UTC with microseconds, so text comparison in SQL orders the
/// same way as time does.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_timestamp(s: &str) -> DatabaseResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::InvalidData(format!("bad timestamp {s:?}: {e}")))
}
