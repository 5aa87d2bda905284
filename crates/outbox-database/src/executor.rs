//! Async SQLite executor using a dedicated background thread.
//!
//! All statements run on one thread owned by `tokio_rusqlite`; callers send
//! closures through a channel and await the result. SQLite serializes writes
//! anyway, so a single executor gives FIFO ordering without blocking the
//! Tokio runtime.
//!
//! Only SQL and lightweight row mapping belong inside `call()`. Handler
//! invocation, network calls and sleeps must happen outside.
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let due = db.call(move |conn| queries::select_due(conn, 50, now)).await?;
//! ```

use crate::{migrations, DatabaseError, DatabaseResult};
use rusqlite::TransactionBehavior;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA cache_size = -64000;
    PRAGMA temp_store = MEMORY;
    PRAGMA busy_timeout = 5000;
";

/// Convert a tokio_rusqlite::Error to DatabaseError.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::ConnectionClosed => {
            DatabaseError::Connection("Connection closed".to_string())
        }
        other => DatabaseError::Connection(other.to_string()),
    }
}

fn run_immediate<F, T>(conn: &mut rusqlite::Connection, f: F) -> DatabaseResult<T>
where
    F: FnOnce(&rusqlite::Transaction<'_>) -> DatabaseResult<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    // Dropping an uncommitted transaction rolls it back.
    tx.commit()?;
    Ok(value)
}

/// Async SQLite database with a dedicated executor thread.
///
/// Cheap to clone; every clone talks to the same executor.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: String,
}

impl AsyncDatabase {
    /// Open a database at the given path.
    ///
    /// Creates the file and its parent directory if needed, enables WAL mode
    /// and runs pending migrations.
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().to_string();
        info!(path = %path_str, "Opening async database");

        let conn = Connection::open(path)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let db = Self {
            conn,
            path: path_str,
        };
        db.call_sqlite(|conn| conn.execute_batch(PRAGMAS)).await?;
        db.call(|conn| migrations::run_migrations(conn)).await?;

        info!(path = %db.path, "Async database initialized with WAL mode");
        Ok(db)
    }

    /// Open a private in-memory database with the schema applied.
    pub async fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let db = Self {
            conn,
            path: ":memory:".to_string(),
        };
        db.call_sqlite(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;")).await?;
        db.call(|conn| migrations::run_migrations(conn)).await?;
        Ok(db)
    }

    /// Execute a closure on the database connection.
    ///
    /// The closure runs on the dedicated SQLite thread. The caller's async
    /// task is parked (not blocked) until the result is ready.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        // Our own result travels inside tokio_rusqlite's Ok variant.
        let outer_result = self.conn.call(move |conn| Ok(f(conn))).await;

        match outer_result {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Execute a closure that returns a rusqlite::Result.
    pub async fn call_sqlite<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)?))
            .await
            .map_err(from_tokio_rusqlite)
    }

    /// Execute a closure inside an `IMMEDIATE` transaction.
    ///
    /// Commits when the closure returns `Ok`, rolls back when it returns
    /// `Err`. The write lock is taken up front, so two transactions on
    /// separate connections cannot both read and then race to write.
    pub async fn transaction<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let outer_result = self
            .conn
            .call(move |conn| Ok(run_immediate(conn, f)))
            .await;

        match outer_result {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Get the database file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if the database is healthy by executing a simple query.
    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call_sqlite(|conn| conn.execute_batch("SELECT 1")).await?;
        debug!("Database health check passed");
        Ok(())
    }

    /// Close the database connection after pending operations complete.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to close database: {:?}", e)))?;
        info!(path = %self.path, "Database closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{queries, NewOutboxMessage};
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_async_database_open() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("outbox.sqlite");

        let db = AsyncDatabase::open(&db_path).await.unwrap();
        assert!(db.health_check().await.is_ok());
        assert!(db_path.exists());
        assert_eq!(db.path(), db_path.to_string_lossy());
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("outbox.sqlite");
        let msg = NewOutboxMessage::new("search.index", "{}");
        let id = msg.id.clone();

        let db = AsyncDatabase::open(&db_path).await.unwrap();
        db.call(move |conn| queries::append_message(conn, &msg, Utc::now()))
            .await
            .unwrap();
        db.close().await.unwrap();

        let db = AsyncDatabase::open(&db_path).await.unwrap();
        let found = db
            .call(move |conn| queries::get_message(conn, &id))
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_transaction_commits_on_ok() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let msg = NewOutboxMessage::new("cache.invalidate", "{}");
        let id = msg.id.clone();

        db.transaction(move |tx| queries::append_message(tx, &msg, Utc::now()))
            .await
            .unwrap();

        let found = db
            .call(move |conn| queries::get_message(conn, &id))
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_err() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let msg = NewOutboxMessage::new("cache.invalidate", "{}");
        let id = msg.id.clone();

        let result: DatabaseResult<()> = db
            .transaction(move |tx| {
                queries::append_message(tx, &msg, Utc::now())?;
                Err(DatabaseError::InvalidData("domain rule violated".to_string()))
            })
            .await;
        assert!(matches!(result, Err(DatabaseError::InvalidData(_))));

        let found = db
            .call(move |conn| queries::get_message(conn, &id))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_call_sqlite_surfaces_errors() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let result = db
            .call_sqlite(|conn| conn.execute("INSERT INTO missing_table VALUES (1)", []))
            .await;
        assert!(matches!(result, Err(DatabaseError::Sqlite(_))));
    }
}
