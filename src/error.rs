//! Error types for Kronos.

use thiserror::Error;

/// Main error type for Kronos operations.
#[derive(Error, Debug)]
pub enum KronosError {
    /// A limiter was configured with a non-positive limit or time period
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared ledger file holds something that is not a timestamp
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Rate limiting errors
    #[error("Rate limit error: {0}")]
    RateLimit(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Kronos operations.
pub type Result<T> = std::result::Result<T, KronosError>;
