//! Database migrations.
//!
//! Migrations run in order and are tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_messages(conn)?;
    }
    if current_version < 2 {
        migrate_v2_claim_leases(conn)?;
    }
    if current_version < 3 {
        migrate_v3_dead_letters(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: Outbox message table.
fn migrate_v1_outbox_messages(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: outbox messages");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_messages (
            id TEXT PRIMARY KEY,
            message_type TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            scheduled_at TEXT NOT NULL,
            processed_at TEXT,
            error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0)
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_due
            ON outbox_messages(scheduled_at)
            WHERE processed_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_outbox_processed_at
            ON outbox_messages(processed_at)
            WHERE processed_at IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_outbox_message_type
            ON outbox_messages(message_type);
        ",
    )?;

    record_migration(conn, 1, "outbox_messages")?;
    Ok(())
}

/// V2: Claim leases so that concurrent workers never hold the same row.
fn migrate_v2_claim_leases(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: claim leases");

    conn.execute_batch(
        "
        ALTER TABLE outbox_messages ADD COLUMN claimed_by TEXT;
        ALTER TABLE outbox_messages ADD COLUMN claimed_until TEXT;

        CREATE INDEX IF NOT EXISTS idx_outbox_claimed_until
            ON outbox_messages(claimed_until)
            WHERE claimed_until IS NOT NULL;
        ",
    )?;

    record_migration(conn, 2, "claim_leases")?;
    Ok(())
}

/// V3: Dead-letter marker for messages whose retry policy is exhausted.
fn migrate_v3_dead_letters(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v3: dead letters");

    conn.execute_batch(
        "
        ALTER TABLE outbox_messages ADD COLUMN dead_lettered_at TEXT;

        CREATE INDEX IF NOT EXISTS idx_outbox_dead_lettered_at
            ON outbox_messages(dead_lettered_at)
            WHERE dead_lettered_at IS NOT NULL;
        ",
    )?;

    record_migration(conn, 3, "dead_letters")?;
    Ok(())
}
