use syncline_core::SynclineError;
use thiserror::Error;

/// Error type for relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The durable store failed. The connection survives unless the store
    /// is unusable, in which case the process exits for a supervisor
    /// restart.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The peer's state vector references history that was compacted away;
    /// a partial diff cannot be produced. Answered on the wire with
    /// `ERR_HISTORY_LOST`, fatal only to the affected document.
    #[error("history lost for document '{doc_id}'")]
    HistoryLost { doc_id: String },

    /// The peer violated the session protocol; the connection is closed.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Core(#[from] SynclineError),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
