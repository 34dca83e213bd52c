use syncline_core::SynclineError;
use thiserror::Error;

/// Error type for the folder daemon.
///
/// Per-path filesystem failures during walks and writes are logged and
/// skipped at the call site; these variants cover failures of the daemon's
/// own machinery.
#[derive(Debug, Error)]
pub enum FolderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state database error: {0}")]
    State(#[from] rusqlite::Error),

    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("connection error: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("relay rejected handshake: {0}")]
    Handshake(String),

    #[error(transparent)]
    Core(#[from] SynclineError),
}

/// Result type alias for folder daemon operations.
pub type Result<T> = std::result::Result<T, FolderError>;
