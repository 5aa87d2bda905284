//! Handler traits.
//!
//! [`OutboxHandler`] is the object-safe shape the registry stores: it gets the
//! raw `content` string. [`MessageHandler`] is the typed form most handlers
//! implement; [`TypedHandler`] adapts one to the other by deserializing the
//! payload first.

use crate::HandlerError;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by handlers and downstream collaborators.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Performs the side effect described by a message.
///
/// Implementations must be idempotent: a message can be delivered more than
/// once. `cancel` fires on shutdown; long handlers should watch it and return
/// [`HandlerError::Cancelled`].
pub trait OutboxHandler: Send + Sync {
    fn handle<'a>(&'a self, content: &'a str, cancel: CancellationToken) -> HandlerFuture<'a>;
}

/// A handler for one message type with a JSON payload.
pub trait MessageHandler: Send + Sync + 'static {
    /// Message type this handler is registered under.
    const MESSAGE_TYPE: &'static str;

    type Payload: DeserializeOwned + Send;

    fn handle(&self, payload: Self::Payload, cancel: CancellationToken) -> HandlerFuture<'_>;
}

/// Adapter that deserializes `content` into `H::Payload` before invoking `H`.
pub struct TypedHandler<H>(pub H);

impl<H: MessageHandler> OutboxHandler for TypedHandler<H> {
    fn handle<'a>(&'a self, content: &'a str, cancel: CancellationToken) -> HandlerFuture<'a> {
        match serde_json::from_str::<H::Payload>(content) {
            Ok(payload) => self.0.handle(payload, cancel),
            Err(e) => Box::pin(async move { Err(HandlerError::InvalidPayload(e.to_string())) }),
        }
    }
}

/// Handler built from an async closure over the raw content.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as an [`OutboxHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(String, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> OutboxHandler for FnHandler<F>
where
    F: Fn(String, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle<'a>(&'a self, content: &'a str, cancel: CancellationToken) -> HandlerFuture<'a> {
        Box::pin((self.f)(content.to_string(), cancel))
    }
}
