//! Downstream collaborators and the handlers that drive them.
//!
//! Each collaborator is a narrow trait so the binary can plug in a real
//! client and tests can plug in a recorder. The handlers own the payload
//! shape for their message type.

use crate::handler::{HandlerFuture, MessageHandler};
use crate::HandlerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// ==========================================
// Cache invalidation
// ==========================================

/// Removes entries from a cache.
pub trait CacheInvalidator: Send + Sync + 'static {
    fn evict_keys<'a>(&'a self, keys: &'a [String]) -> HandlerFuture<'a>;

    /// Evict every key matching a glob-style pattern.
    fn evict_pattern<'a>(&'a self, pattern: &'a str) -> HandlerFuture<'a>;
}

/// Payload of a `cache.invalidate` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInvalidation {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

pub struct CacheInvalidationHandler<C> {
    cache: Arc<C>,
}

impl<C: CacheInvalidator> CacheInvalidationHandler<C> {
    pub fn new(cache: Arc<C>) -> Self {
        Self { cache }
    }
}

impl<C: CacheInvalidator> MessageHandler for CacheInvalidationHandler<C> {
    const MESSAGE_TYPE: &'static str = "cache.invalidate";
    type Payload = CacheInvalidation;

    fn handle(&self, payload: CacheInvalidation, cancel: CancellationToken) -> HandlerFuture<'_> {
        Box::pin(async move {
            if payload.keys.is_empty() && payload.patterns.is_empty() {
                return Err(HandlerError::InvalidPayload(
                    "expected at least one key or pattern".to_string(),
                ));
            }

            if !payload.keys.is_empty() {
                self.cache.evict_keys(&payload.keys).await?;
            }
            for pattern in &payload.patterns {
                if cancel.is_cancelled() {
                    return Err(HandlerError::Cancelled);
                }
                self.cache.evict_pattern(pattern).await?;
            }

            debug!(
                keys = payload.keys.len(),
                patterns = payload.patterns.len(),
                "Cache invalidated"
            );
            Ok(())
        })
    }
}

// ==========================================
// Search index
// ==========================================

/// Writes documents to a search index.
pub trait SearchIndex: Send + Sync + 'static {
    fn upsert<'a>(
        &'a self,
        index: &'a str,
        id: &'a str,
        document: &'a serde_json::Value,
    ) -> HandlerFuture<'a>;

    fn delete<'a>(&'a self, index: &'a str, id: &'a str) -> HandlerFuture<'a>;
}

/// Payload of a `search.index` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SearchIndexOp {
    Upsert {
        index: String,
        id: String,
        document: serde_json::Value,
    },
    Delete {
        index: String,
        id: String,
    },
}

pub struct SearchIndexHandler<S> {
    search: Arc<S>,
}

impl<S: SearchIndex> SearchIndexHandler<S> {
    pub fn new(search: Arc<S>) -> Self {
        Self { search }
    }
}

impl<S: SearchIndex> MessageHandler for SearchIndexHandler<S> {
    const MESSAGE_TYPE: &'static str = "search.index";
    type Payload = SearchIndexOp;

    fn handle(&self, payload: SearchIndexOp, _cancel: CancellationToken) -> HandlerFuture<'_> {
        Box::pin(async move {
            match &payload {
                SearchIndexOp::Upsert {
                    index,
                    id,
                    document,
                } => self.search.upsert(index, id, document).await,
                SearchIndexOp::Delete { index, id } => self.search.delete(index, id).await,
            }
        })
    }
}

// ==========================================
// Notifications
// ==========================================

/// A rendered-on-send notification request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub template: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

/// Sends notifications (email, push, ...).
pub trait Notifier: Send + Sync + 'static {
    fn send<'a>(&'a self, notification: &'a Notification) -> HandlerFuture<'a>;
}

pub struct NotificationHandler<N> {
    notifier: Arc<N>,
}

impl<N: Notifier> NotificationHandler<N> {
    pub fn new(notifier: Arc<N>) -> Self {
        Self { notifier }
    }
}

impl<N: Notifier> MessageHandler for NotificationHandler<N> {
    const MESSAGE_TYPE: &'static str = "notification.send";
    type Payload = Notification;

    fn handle(&self, payload: Notification, _cancel: CancellationToken) -> HandlerFuture<'_> {
        Box::pin(async move {
            if payload.to.is_empty() {
                return Err(HandlerError::InvalidPayload(
                    "notification has no recipients".to_string(),
                ));
            }
            self.notifier.send(&payload).await
        })
    }
}
