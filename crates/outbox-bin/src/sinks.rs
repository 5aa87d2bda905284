//! Downstream collaborators that only log what they would do.
//!
//! outboxd ships without network clients for the cache, search index or
//! notification service; these sinks make every effect visible in the
//! structured log so deployments can swap in real clients behind the same
//! traits.

use outbox_dispatcher::effects::Notification;
use outbox_dispatcher::{CacheInvalidator, HandlerFuture, Notifier, SearchIndex};
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl CacheInvalidator for LogSink {
    fn evict_keys<'a>(&'a self, keys: &'a [String]) -> HandlerFuture<'a> {
        Box::pin(async move {
            info!(keys = ?keys, "cache evict keys");
            Ok(())
        })
    }

    fn evict_pattern<'a>(&'a self, pattern: &'a str) -> HandlerFuture<'a> {
        Box::pin(async move {
            info!(pattern, "cache evict pattern");
            Ok(())
        })
    }
}

impl SearchIndex for LogSink {
    fn upsert<'a>(
        &'a self,
        index: &'a str,
        id: &'a str,
        document: &'a serde_json::Value,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            info!(index, id, document = %document, "search upsert");
            Ok(())
        })
    }

    fn delete<'a>(&'a self, index: &'a str, id: &'a str) -> HandlerFuture<'a> {
        Box::pin(async move {
            info!(index, id, "search delete");
            Ok(())
        })
    }
}

impl Notifier for LogSink {
    fn send<'a>(&'a self, notification: &'a Notification) -> HandlerFuture<'a> {
        Box::pin(async move {
            info!(
                template = %notification.template,
                recipients = notification.to.len(),
                "notification send"
            );
            Ok(())
        })
    }
}
