//! Error types for Turnstile.
//!
//! Admission decisions never fail; these errors only surface while loading
//! configuration, wiring policies, or starting the server.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure while reading or merging configuration sources
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] ::config::ConfigError),

    /// Background work requested outside of a Tokio runtime
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
