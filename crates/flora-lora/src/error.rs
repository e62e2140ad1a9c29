//! Error types for adapter operations.

use flora_core::FloraError;
use mlx_rs::error::Exception;

use crate::layer::BackupState;

/// Result type for adapter operations.
pub type Result<T> = std::result::Result<T, LoraError>;

/// Error type for adapter operations.
#[derive(Debug, thiserror::Error)]
pub enum LoraError {
    /// MLX error.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),

    /// Safetensors error.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration or file level error.
    #[error(transparent)]
    Core(#[from] FloraError),

    /// Split dimensions do not fit the target layer.
    #[error("Invalid split: {0}")]
    InvalidSplit(String),

    /// Two adapters resolved to the same name.
    #[error("Duplicated lora name: {0}")]
    DuplicateName(String),

    /// The layer slot already routes through an adapter.
    #[error("Layer already has adapter {0} attached")]
    AlreadyAttached(String),

    /// Backup state machine rejected the operation.
    #[error("Illegal weight transition: {operation} from {from:?}")]
    IllegalTransition {
        /// Requested operation.
        operation: &'static str,
        /// State the layer was in (`None` when no backup exists).
        from: Option<BackupState>,
    },

    /// Convolution kernel the delta math does not handle.
    #[error("Unsupported convolution kernel {0:?} (only 1x1 and 3x3 are supported)")]
    UnsupportedKernel(Vec<i32>),

    /// A required weight is absent.
    #[error("Missing weight: {0}")]
    MissingWeight(String),

    /// Shape mismatch error.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Invalid state error.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}
