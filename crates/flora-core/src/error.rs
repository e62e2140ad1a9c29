//! Error types for flora.

use thiserror::Error;

/// Result type alias for flora operations.
pub type Result<T> = std::result::Result<T, FloraError>;

/// Main error type for configuration and file level operations.
#[derive(Error, Debug)]
pub enum FloraError {
    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
