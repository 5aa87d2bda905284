//! Long-running service: dispatcher plus retention sweeper.

use crate::sinks::LogSink;
use outbox_config_and_utils::{Config, Paths};
use outbox_dispatcher::{
    CacheInvalidationHandler, Dispatcher, DispatcherConfig, HandlerRegistry, NotificationHandler,
    RetentionSweeper, RetryPolicy, SearchIndexHandler,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run until Ctrl-C, then wait for in-flight work to settle.
pub async fn run_service(config: Config, paths: Paths) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(&paths).await?;
    info!(path = %paths.database_file().display(), "Outbox database ready");

    let registry = Arc::new(build_registry(Arc::new(LogSink)));
    let dispatcher = Dispatcher::new(
        store.clone(),
        registry,
        dispatcher_config(&config, worker_id()),
    )?;
    let sweeper = RetentionSweeper::new(
        store.clone(),
        chrono::Duration::from_std(config.retention())?,
        config.sweep_interval(),
    );

    let shutdown = CancellationToken::new();
    let dispatcher_task = dispatcher.spawn(shutdown.clone());
    let sweeper_task = sweeper.spawn(shutdown.clone());

    info!("outboxd running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.cancel();

    if let Err(e) = dispatcher_task.await {
        warn!(error = %e, "Dispatcher task ended abnormally");
    }
    if let Err(e) = sweeper_task.await {
        warn!(error = %e, "Sweeper task ended abnormally");
    }

    store.db().clone().close().await?;
    info!("outboxd stopped");
    Ok(())
}

/// Register the built-in handlers against one set of collaborators.
pub(crate) fn build_registry(sink: Arc<LogSink>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_typed(CacheInvalidationHandler::new(sink.clone()));
    registry.register_typed(SearchIndexHandler::new(sink.clone()));
    registry.register_typed(NotificationHandler::new(sink));
    registry
}

pub(crate) fn dispatcher_config(config: &Config, worker_id: String) -> DispatcherConfig {
    DispatcherConfig {
        worker_id,
        poll_interval: config.poll_interval(),
        batch_size: config.batch_size,
        max_concurrency: config.max_concurrency,
        handler_timeout: config.handler_timeout(),
        lease_duration: config.lease_duration(),
        retry: RetryPolicy {
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
            max_attempts: config.max_attempts(),
        },
    }
}

/// `<hostname>-<pid>`, unique per running process.
fn worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "outboxd".to_string());
    format!("{}-{}", host, std::process::id())
}
