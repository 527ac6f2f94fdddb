//! Error types for the rate-limited task queue.

use thiserror::Error;

/// Main error type for producer-facing queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// A submission carried both a prebuilt task handle and a callable, or neither
    #[error("Invalid arguments: pass either a task handle or a callable, not both")]
    InvalidArguments,

    /// The limiter is stopped, shutting down, or was never started
    #[error("Limiter {0} is not running")]
    NotRunning(String),

    /// No limiter is registered under the requested name
    #[error("Unknown limiter: {0}")]
    UnknownLimiter(String),

    /// Conflicting or out-of-range configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
