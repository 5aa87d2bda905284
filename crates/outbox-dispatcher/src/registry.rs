//! Message type to handler mapping.

use crate::handler::{MessageHandler, OutboxHandler, TypedHandler};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Maps message types to handlers.
///
/// Built once at startup and shared read-only with the dispatcher.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn OutboxHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    pub fn register(&mut self, message_type: impl Into<String>, handler: impl OutboxHandler + 'static) {
        self.register_arc(message_type, Arc::new(handler));
    }

    pub fn register_arc(&mut self, message_type: impl Into<String>, handler: Arc<dyn OutboxHandler>) {
        let message_type = message_type.into();
        if self.handlers.insert(message_type.clone(), handler).is_some() {
            warn!(message_type = %message_type, "Replaced previously registered handler");
        } else {
            debug!(message_type = %message_type, "Registered handler");
        }
    }

    /// Register a typed handler under its `MESSAGE_TYPE`.
    pub fn register_typed<H: MessageHandler>(&mut self, handler: H) {
        self.register(H::MESSAGE_TYPE, TypedHandler(handler));
    }

    pub fn resolve(&self, message_type: &str) -> Option<Arc<dyn OutboxHandler>> {
        self.handlers.get(message_type).cloned()
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Registered types, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}
