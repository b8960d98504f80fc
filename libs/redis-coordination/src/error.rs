//! Error types for coordination-store operations.
//!
//! Contention is never an error here: operations that lose a race return
//! `None`/`false`/`0` so callers can retry or skip. These variants cover the
//! failures that are not part of the admission protocol itself.

use thiserror::Error;

/// Top-level error type for the redis-coordination crate.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Connection or transport-level failure talking to the store.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out waiting for the store.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Codec error during serialization or deserialization of a payload.
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error (e.g. missing required fields).
    #[error("configuration error: {0}")]
    Config(String),

    /// The store returned a reply shape the client does not understand.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CoordinationError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry (transport or timeout).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Transport(_) | CoordinationError::Timeout(_)
        )
    }

    /// Returns true if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoordinationError::Timeout(_))
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
