use cairn_types::Key;

/// Errors from node store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested node was not found.
    #[error("node not found: {0}")]
    NotFound(Key),

    /// Content hash mismatch on read (data corruption).
    #[error("hash mismatch for {key}: computed {computed}")]
    HashMismatch { key: Key, computed: Key },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The stored bytes are malformed or cannot be decoded.
    #[error("corrupt node {key}: {reason}")]
    CorruptNode { key: Key, reason: String },

    /// The backend could not be reached or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
