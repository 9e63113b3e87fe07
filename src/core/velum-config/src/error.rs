//! Configuration error types.

use thiserror::Error;

/// Errors that can occur while parsing or validating an encryption config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unknown provider or desired mode string.
    #[error("unknown encryption mode: {0}")]
    UnknownMode(String),

    /// Malformed key identifier.
    #[error("invalid key id: {0}")]
    InvalidKeyId(String),

    /// The config violates a structural invariant.
    #[error("invalid encryption config: {0}")]
    Invalid(String),
}
