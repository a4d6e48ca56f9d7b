//! Error types for keyrate.

use thiserror::Error;

/// Main error type for keyrate operations.
#[derive(Error, Debug)]
pub enum KeyrateError {
    /// A rate that is negative or NaN
    #[error("Invalid rate: {0} (must be a non-negative number of permits per second)")]
    InvalidRate(f64),

    /// A registry or cache capacity of zero
    #[error("Invalid capacity: must be at least 1")]
    InvalidCapacity,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors from layered configuration sources
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),
}

/// Result type alias for keyrate operations.
pub type Result<T> = std::result::Result<T, KeyrateError>;
