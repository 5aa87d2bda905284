//! One-shot operator commands.

use outbox_config_and_utils::{Config, Paths};
use outbox_database::NewOutboxMessage;
use outbox_dispatcher::RetentionSweeper;
use std::time::Duration;

type CommandResult = Result<(), Box<dyn std::error::Error>>;

/// Append a message, optionally delayed.
pub async fn enqueue(
    paths: &Paths,
    message_type: String,
    content: String,
    delay_secs: Option<u64>,
) -> CommandResult {
    // Reject content the typed handlers could never decode
    serde_json::from_str::<serde_json::Value>(&content)?;

    let store = super::open_store(paths).await?;
    let mut message = NewOutboxMessage::new(message_type, content);
    if let Some(secs) = delay_secs {
        let delay = chrono::Duration::from_std(Duration::from_secs(secs))?;
        let at = store
            .now()
            .checked_add_signed(delay)
            .ok_or("delay is too large")?;
        message = message.scheduled_at(at);
    }

    let appended = store.append(message).await?;
    println!("Enqueued {}", appended.id);
    println!("  Type:      {}", appended.message_type);
    println!("  Scheduled: {}", appended.scheduled_at.to_rfc3339());
    Ok(())
}

/// Run one retention sweep.
pub async fn sweep(config: &Config, paths: &Paths, older_than_hours: Option<u64>) -> CommandResult {
    let retention = match older_than_hours {
        Some(hours) => Duration::from_secs(hours.saturating_mul(3_600)),
        None => config.retention(),
    };

    let store = super::open_store(paths).await?;
    let sweeper = RetentionSweeper::new(
        store,
        chrono::Duration::from_std(retention)?,
        config.sweep_interval(),
    );
    let deleted = sweeper.sweep_once().await?;
    println!("Deleted {} processed message(s)", deleted);
    Ok(())
}

pub async fn status(paths: &Paths) -> CommandResult {
    let store = super::open_store(paths).await?;
    let stats = store.stats().await?;

    println!("Outbox: {}", paths.database_file().display());
    println!("  Pending:       {} ({} due)", stats.pending, stats.due);
    println!("  Leased:        {}", stats.leased);
    println!("  Processed:     {}", stats.processed);
    println!("  Dead-lettered: {}", stats.dead_lettered);
    Ok(())
}

pub async fn dead_letters(paths: &Paths, limit: usize) -> CommandResult {
    let store = super::open_store(paths).await?;
    let messages = store.list_dead_lettered(limit).await?;

    if messages.is_empty() {
        println!("No dead-lettered messages");
        return Ok(());
    }

    for message in messages {
        println!(
            "{}  {}  retries={}  error={}",
            message.id,
            message.message_type,
            message.retry_count,
            message.error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
