//! Error types for the Tollgate service.

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while layering configuration sources
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// A policy was built with values that can never be enforced
    #[error("Invalid rate limit policy: {0}")]
    InvalidPolicy(String),

    /// Counter store errors surfaced outside the request path
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
