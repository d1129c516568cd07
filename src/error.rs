//! Error types for the load shedder.

use thiserror::Error;

/// Main error type for load shedder operations.
#[derive(Error, Debug)]
pub enum ShedderError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The listening socket could not be created
    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or unexpected wire data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A request could not be classified
    #[error("Classification error: {0}")]
    Classification(String),

    /// A socket operation did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for ShedderError {
    fn from(err: config::ConfigError) -> Self {
        ShedderError::Config(err.to_string())
    }
}

/// Result type alias for load shedder operations.
pub type Result<T> = std::result::Result<T, ShedderError>;
