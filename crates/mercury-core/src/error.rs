//! Error types for mercury-core.

use thiserror::Error;

/// Result type for mercury-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mercury-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The Jupyter server process exited (or never reported where it listens)
    /// before connection info became available.
    #[error("kernel failed to start{}: {message}", exit_code.map(|c| format!(" (exit code {})", c)).unwrap_or_default())]
    KernelStartFailure {
        message: String,
        exit_code: Option<i32>,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// No live session to run the operation against.
    #[error("session disposed")]
    SessionDisposed,

    /// Guest attach handshake with the host failed.
    #[error("live share sync failed: {0}")]
    LiveShareSyncFailure(String),

    /// No kernel spec matches the request.
    #[error("kernel spec not found: {0}")]
    KernelSpecNotFound(String),

    /// Kernel-side or kernel transport failure.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// HTTP request against the Jupyter server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket failure on a kernel channel.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// An operation did not settle in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Peer-to-peer RPC failure.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is a caller-requested cancellation.
    ///
    /// Cancellations are expected and are not logged as failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
