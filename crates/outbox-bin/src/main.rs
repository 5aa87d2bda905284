//! outboxd - delivers transactional outbox messages to downstream systems.

mod app;
mod sinks;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use outbox_config_and_utils::{init_logging, Config, LogConfig, Paths};

/// Outbox relay command-line interface.
#[derive(Parser)]
#[command(name = "outboxd")]
#[command(about = "Delivers transactional outbox messages to their handlers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, database and logs. Defaults to ~/.outbox-relay
    #[arg(long, global = true, env = "OUTBOX_BASE_DIR")]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher and retention sweeper until Ctrl-C
    Run,
    /// Append a message to the outbox
    Enqueue {
        /// Message type, e.g. cache.invalidate
        message_type: String,
        /// JSON payload
        content: String,
        /// Delay before the message becomes due
        #[arg(long)]
        delay_secs: Option<u64>,
    },
    /// Delete processed messages once
    Sweep {
        /// Override the configured retention
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
    /// Show message counts per state
    Status,
    /// List dead-lettered messages
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;

    let command = cli.command.unwrap_or(Commands::Run);
    let log_config = LogConfig {
        default_level: cli.log_level.unwrap_or_else(|| config.log_level.clone()),
        // Only the long-running service writes the JSONL file
        log_file: matches!(command, Commands::Run).then(|| paths.log_file()),
        also_stderr: true,
    };
    init_logging(log_config)?;

    match command {
        Commands::Run => app::run_service(config, paths).await?,
        Commands::Enqueue {
            message_type,
            content,
            delay_secs,
        } => app::enqueue(&paths, message_type, content, delay_secs).await?,
        Commands::Sweep { older_than_hours } => {
            app::sweep(&config, &paths, older_than_hours).await?
        }
        Commands::Status => app::status(&paths).await?,
        Commands::DeadLetters { limit } => app::dead_letters(&paths, limit).await?,
    }

    Ok(())
}
