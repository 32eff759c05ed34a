//! Error types for the CouchDB client.
//!
//! # Design
//! Server-reported failures (`{"ok":false}`, `{"error":...}`) are not Rust
//! errors: the classifier folds them into an error `Outcome`, exactly like a
//! transport failure. The types here cover the remaining concerns: the
//! transport itself, request tracker bookkeeping, descriptor construction and
//! the async client surface.

use thiserror::Error;

use crate::tracker::ExchangeHandle;

/// Connection, DNS or I/O failure reported by a `Transport`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport failure: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Bookkeeping faults of the request tracker. Unreachable in correct use.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// The same descriptor instance is already in flight.
    #[error("descriptor {0} is already in flight")]
    DuplicateSubmission(uuid::Uuid),

    /// No exchange is tracked under this handle (late callback).
    #[error("unknown exchange handle {0}")]
    UnknownHandle(ExchangeHandle),
}

/// Errors returned by `CouchClient` builder methods.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request payload could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned by the async `CouchDb` surface.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The reactor refused the submission (same descriptor instance twice).
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// The client instance was shut down before the outcome was produced.
    #[error("client disposed before the operation completed")]
    Disposed,
}
