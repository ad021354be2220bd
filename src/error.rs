//! Error types for the admission control core.

use std::time::Duration;

use thiserror::Error;

/// Main error type for admission control setup.
///
/// Nothing in the per-request path returns this type; a request is only ever
/// admitted or rejected.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy was defined with a zero window or a zero ceiling
    #[error("Invalid policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    /// Shared store errors raised while setting up a store
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by the shared store on the distributed path.
///
/// The admission gate absorbs every variant by falling back to the local
/// counter.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The Redis client reported a failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store round trip did not complete in time
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store could not be reached or refused the call
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for admission control operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;

impl From<config::ConfigError> for AdmissionError {
    fn from(err: config::ConfigError) -> Self {
        AdmissionError::Config(err.to_string())
    }
}
