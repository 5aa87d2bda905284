//! Application wiring and one-shot commands.

mod commands;
mod init;

pub use commands::{dead_letters, enqueue, status, sweep};
pub use init::run_service;

use outbox_config_and_utils::Paths;
use outbox_database::{AsyncDatabase, OutboxStore};

/// Open the outbox database under `paths`, applying migrations.
pub(crate) async fn open_store(paths: &Paths) -> Result<OutboxStore, Box<dyn std::error::Error>> {
    paths.ensure_dirs()?;
    let db = AsyncDatabase::open(&paths.database_file()).await?;
    Ok(OutboxStore::new(db))
}
