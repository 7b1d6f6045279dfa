//! Store error taxonomy.
//!
//! Every error crossing the `ObjectStore` port is classified into one of
//! these kinds. The retry layer inspects only [`StoreError::is_retryable`];
//! everything else flows upward unchanged so the filesystem layer can map it
//! to the right errno.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by object-store operations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// The named object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// A conditional request's generation precondition did not hold.
    #[error("precondition failed for {name}: expected generation {expected}")]
    PreconditionFailed {
        /// Object the condition applied to.
        name: String,
        /// The generation the caller expected.
        expected: i64,
    },

    /// Creation conflict: the object already exists.
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// Authentication or authorization failure.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The store asked us to slow down (HTTP 429 and equivalents).
    #[error("rate limited by store: {0}")]
    RateLimited(String),

    /// Server-side failure (HTTP 5xx and equivalents).
    #[error("server error ({status}): {message}")]
    Server {
        /// Status code reported by the store.
        status: u16,
        /// Server-supplied detail.
        message: String,
    },

    /// Transport-level failure before a response was obtained.
    #[error("network error: {0}")]
    Network(String),

    /// The per-request deadline elapsed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Argument domain error.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Local I/O failure (disk cache, scratch files).
    #[error("I/O error: {0}")]
    Io(String),
}

impl StoreError {
    /// True for errors the retry wrapper is allowed to absorb.
    ///
    /// Precondition failures and 4xx semantic errors are never retried:
    /// repeating them cannot succeed and, for preconditions, would mask the
    /// concurrent mutation the caller needs to observe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Network(_)
                | StoreError::Server { .. }
                | StoreError::RateLimited(_)
                | StoreError::Timeout(_)
        )
    }

    /// True if this is the remembered-absent case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}
