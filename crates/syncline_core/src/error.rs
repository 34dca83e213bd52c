use thiserror::Error;

/// Unified error type for Syncline core operations.
#[derive(Debug, Error)]
pub enum SynclineError {
    /// General error for any kind of I/O issue not otherwise documented here.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame failed to decode: truncated input, a length field pointing
    /// past the end of the buffer, an unknown message type or a non-UTF-8
    /// document id.
    ///
    /// The relay closes the connection on this error; clients log it and
    /// reconnect with backoff.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// An update, state vector or document state blob failed to decode or
    /// apply at the CRDT layer.
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// A JSON payload (HELLO handshake, index entry) failed to serialize or
    /// deserialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Syncline core operations.
pub type Result<T> = std::result::Result<T, SynclineError>;
