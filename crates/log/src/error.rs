//! Logging errors

use thiserror::Error;

/// Errors raised while setting up logging
#[derive(Debug, Error)]
pub enum LogError {
    /// The filter directive did not parse
    #[error("Invalid log filter: {0}")]
    Filter(String),

    /// Configuration is unusable
    #[error("Invalid log configuration: {0}")]
    Config(String),

    /// A global subscriber is already installed
    #[error("Logger already initialized: {0}")]
    Init(String),
}

/// Result type for logging setup
pub type LogResult<T> = Result<T, LogError>;
