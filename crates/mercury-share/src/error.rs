//! Error types for session sharing.

use std::path::PathBuf;

/// Share error type.
#[derive(Debug, thiserror::Error)]
pub enum ShareError {
    /// IO error.
    #[error("IO error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Mercury core error.
    #[error("Core error: {0}")]
    Core(#[from] mercury_core::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid operation.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<std::io::Error> for ShareError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            message: e.to_string(),
        }
    }
}

/// Result type for share operations.
pub type ShareResult<T> = Result<T, ShareError>;
