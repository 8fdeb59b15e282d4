//! Error types shared by the session machine, recording store and upload queue.

use thiserror::Error;

/// Errors surfaced by core commands
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Microphone access has not been authorized")]
    PermissionDenied,

    #[error("Audio device is busy: {0}")]
    ResourceBusy(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Cannot {operation} while {state}")]
    InvalidStateTransition {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upload failed (retryable): {0}")]
    UploadRetryable(String),

    #[error("Upload failed permanently: {0}")]
    UploadPermanent(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Stable machine-readable code for API consumers
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::PermissionDenied => "PERMISSION_DENIED",
            CoreError::ResourceBusy(_) => "RESOURCE_BUSY",
            CoreError::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            CoreError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::UploadRetryable(_) => "UPLOAD_RETRYABLE",
            CoreError::UploadPermanent(_) => "UPLOAD_PERMANENT",
            CoreError::Storage(_) => "STORAGE_ERROR",
            CoreError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Result type alias using CoreError
pub type CoreResult<T> = Result<T, CoreError>;
