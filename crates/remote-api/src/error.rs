//! Error types for the remote API client.

use sitesync_core::sync::{classify_http_status, RetryClass};
use thiserror::Error;

/// Result type alias for remote API operations.
pub type Result<T> = std::result::Result<T, RemoteApiError>;

/// Errors that can occur while talking to the backend.
#[derive(Debug, Error)]
pub enum RemoteApiError {
    /// HTTP client error (connect, timeout, body)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success response from the backend
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The operation cannot be turned into a request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Client misconfiguration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token cannot be sent as a header
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl RemoteApiError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Api { status, .. } => classify_http_status(*status),
            Self::Http(err) if err.is_builder() => RetryClass::Permanent,
            Self::Http(_) => RetryClass::Retryable,
            Self::Json(_) => RetryClass::Permanent,
            Self::InvalidRequest(_) => RetryClass::Permanent,
            Self::Config(_) => RetryClass::Permanent,
            Self::Auth(_) => RetryClass::ReauthRequired,
        }
    }
}
