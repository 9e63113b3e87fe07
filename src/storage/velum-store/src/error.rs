//! Storage error types.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic-concurrency conflict: the stored resource version has
    /// advanced past the one the caller presented. Expected; the caller
    /// re-reads and retries.
    #[error("conflict on {key}: expected version {expected}, found {actual}")]
    Conflict {
        /// Object or config key the write raced on.
        key: String,
        /// Version the caller presented.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// Object or config not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Object already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The store cannot serve the request right now (transient, retried
    /// with backoff by level-triggered callers).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Malformed stored data or config document.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Sealing or opening a record failed.
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl StoreError {
    /// True for errors a bounded retry loop should attempt again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Unavailable(_))
    }
}

impl From<velum_crypto::CryptoError> for StoreError {
    fn from(err: velum_crypto::CryptoError) -> Self {
        StoreError::Crypto(err.to_string())
    }
}
