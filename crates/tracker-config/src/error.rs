//! Configuration error types.

use thiserror::Error;

/// Error raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A tunable is outside its permitted range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using ConfigError.
pub type ConfigResult<T> = Result<T, ConfigError>;
