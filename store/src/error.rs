//! Error types for callbill storage.

use callbill_core::StreamSessionId;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("not found")]
    NotFound,

    /// A non-terminal billing session already holds the stream's slot.
    #[error("active billing session already exists for stream {stream_session_id}")]
    ActiveSessionExists {
        /// The stream whose slot is occupied.
        stream_session_id: StreamSessionId,
    },
}
