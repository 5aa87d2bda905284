//! SQLite persistence for the transactional outbox.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread
//! - Schema migrations for the `outbox_messages` table
//! - Model types and the row lifecycle
//! - Query functions usable inside any caller-held transaction
//! - `OutboxStore`, an async facade with an injectable clock
//!
//! Domain code appends messages inside its own transaction:
//!
//! ```ignore
//! db.transaction(move |tx| {
//!     tx.execute("UPDATE accounts SET balance = balance - ?1 WHERE id = ?2", params![amount, id])?;
//!     queries::append_message(tx, &NewOutboxMessage::json("notification.send", &payload)?, now)?;
//!     Ok(())
//! })
//! .await?;
//! ```

mod clock;
mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;
mod store;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;
pub use store::OutboxStore;
pub use types::MessageId;
