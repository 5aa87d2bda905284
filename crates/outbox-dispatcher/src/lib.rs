//! Outbox delivery: handler registry, dispatcher, retry policy and retention.
//!
//! ```text
//! ┌──────────────┐  claim_due   ┌────────────┐  resolve   ┌──────────────────┐
//! │ OutboxStore  │─────────────▶│ Dispatcher │───────────▶│ HandlerRegistry  │
//! │  (SQLite)    │◀─────────────│            │            └────────┬─────────┘
//! └──────┬───────┘  outcomes    └────────────┘                     │ handle
//!        │                                                ┌────────▼─────────┐
//!        │ delete_processed                               │ cache / search / │
//! ┌──────▼───────────┐                                    │ notifications    │
//! │ RetentionSweeper │                                    └──────────────────┘
//! └──────────────────┘
//! ```
//!
//! Delivery is at-least-once: a handler may run again after a crash between
//! the side effect and the outcome write, or after a lease expires.

mod backoff;
mod dispatcher;
pub mod effects;
mod error;
mod handler;
mod registry;
mod sweeper;

pub use backoff::{compute_backoff, RetryPolicy};
pub use dispatcher::{CycleReport, Dispatcher, DispatcherConfig, MessageOutcome, MAX_DELAY};
pub use effects::{
    CacheInvalidationHandler, CacheInvalidator, NotificationHandler, Notifier, SearchIndex,
    SearchIndexHandler,
};
pub use error::{DispatchError, DispatchResult, HandlerError};
pub use handler::{handler_fn, FnHandler, HandlerFuture, MessageHandler, OutboxHandler, TypedHandler};
pub use registry::HandlerRegistry;
pub use sweeper::RetentionSweeper;
