//! Remote API contract consumed by the sync engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::queue_model::QueuedOperation;

/// Server copy of an entity returned with a success or conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntity {
    /// Server-assigned id, when the response carries one.
    pub remote_id: Option<String>,
    pub body: serde_json::Value,
}

impl ServerEntity {
    pub fn new(remote_id: Option<String>, body: serde_json::Value) -> Self {
        Self { remote_id, body }
    }

    /// Server copy for a response without a body (e.g. 204 on delete).
    pub fn empty() -> Self {
        Self::new(None, serde_json::Value::Null)
    }
}

/// Classified result of delivering one queued operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(ServerEntity),
    Conflict(ServerEntity),
    RetryableFailure(String),
    PermanentFailure(String),
}

/// Turns one queued operation into one network call.
///
/// Implementations must send `operation.id` as the idempotency key so a
/// retry after an ambiguous outcome is applied at most once by the backend.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn send(&self, operation: &QueuedOperation) -> Outcome;
}
