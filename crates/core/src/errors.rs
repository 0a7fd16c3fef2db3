//! Error types shared by the sync core.

use thiserror::Error;

/// Result type alias for sync core operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures reported by a durable store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached or opened.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the write because it is full.
    #[error("Storage quota exceeded")]
    QuotaExceeded,

    /// Any other backend failure.
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// Errors surfaced by the queue manager, entity cache and engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Persisting to the local store failed. For `enqueue` this means the
    /// mutation was not recorded and the caller must report it.
    #[error("Local storage error: {0}")]
    LocalStorage(#[from] StoreError),

    /// A stored record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No queued operation has the given id.
    #[error("Queued operation not found: {0}")]
    OperationNotFound(String),

    /// The requested state change is not allowed from the entry's status.
    #[error("Invalid queue transition for {id}: {message}")]
    InvalidTransition { id: String, message: String },

    /// Bad input from the caller.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be read.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn invalid_transition(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidTransition {
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// True when the failure came from the local store rather than from the
    /// caller or the data.
    pub fn is_local_storage(&self) -> bool {
        matches!(self, Self::LocalStorage(_))
    }
}
