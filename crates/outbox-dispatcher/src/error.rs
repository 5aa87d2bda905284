//! Error types for handlers and the dispatcher.

use outbox_database::DatabaseError;
use thiserror::Error;

/// Why a handler invocation did not succeed.
///
/// The `Display` text is what gets persisted in the message's `error` column.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The downstream call failed.
    #[error("{0}")]
    Failed(String),

    /// The downstream call failed in a way expected to clear up on retry.
    #[error("transient: {0}")]
    Transient(String),

    /// Message content did not match the handler's payload shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// No handler is registered for the message type.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// The invocation did not finish within the handler timeout.
    #[error("handler timed out after {0}ms")]
    TimedOut(u128),

    /// The handler panicked; the payload text is kept.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler stopped because shutdown was requested.
    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidPayload(e.to_string())
    }
}

/// Dispatcher error type.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid dispatcher config: {0}")]
    InvalidConfig(String),
}

/// Result type alias using DispatchError.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_error_text() {
        assert_eq!(
            HandlerError::UnknownType("invoice.sent".into()).to_string(),
            "unknown type: invoice.sent"
        );
        assert_eq!(
            HandlerError::TimedOut(1500).to_string(),
            "handler timed out after 1500ms"
        );
        assert_eq!(HandlerError::failed("503 from search").to_string(), "503 from search");
    }

    #[test]
    fn test_json_error_is_invalid_payload() {
        let err: HandlerError = serde_json::from_str::<Vec<String>>("{").unwrap_err().into();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }
}
