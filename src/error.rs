//! Error types for the request throttler.

use thiserror::Error;

/// Main error type for throttler operations.
///
/// Rate-limit rejections are deliberately absent: they are delivered inside a
/// completed [`Response`](crate::throttler::Response), never raised from `submit`.
#[derive(Error, Debug)]
pub enum ThrottlerError {
    /// A rule or throttler was configured with a value it cannot work with
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// `submit` was called after the throttler was disposed
    #[error("Throttler `{0}` has been disposed")]
    Disposed(String),

    /// `submit` was called outside of a tokio runtime
    #[error("No tokio runtime available to schedule requests")]
    NoRuntime,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for ThrottlerError {
    fn from(err: config::ConfigError) -> Self {
        ThrottlerError::Config(err.to_string())
    }
}

/// Result type alias for throttler operations.
pub type Result<T> = std::result::Result<T, ThrottlerError>;
