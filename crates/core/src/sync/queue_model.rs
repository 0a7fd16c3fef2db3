//! Sync queue domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store key prefix for queued operations.
pub const SYNC_QUEUE_PREFIX: &str = "sync_queue/";

/// Store key prefix for cached entity records.
pub const ENTITY_CACHE_PREFIX: &str = "entity/";

/// Store key prefix for the remote id -> local id index.
pub const ENTITY_REMOTE_INDEX_PREFIX: &str = "entity_remote/";

/// Kind of mutation recorded in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// Lifecycle status of a queued operation.
///
/// Success is not a status: a delivered operation is removed from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    FailedRetryable,
    FailedPermanent,
}

impl OperationStatus {
    /// Still waiting to reach the server (counts toward the pending badge).
    pub fn is_undelivered(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::InFlight | Self::FailedRetryable
        )
    }
}

/// Classified failure recorded on a queued operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum DeliveryError {
    /// Timeout, 5xx, throttling. Retried with backoff.
    RetryableNetwork(String),
    /// Validation-type rejection. Kept for the user to resolve.
    PermanentRequest(String),
}

impl DeliveryError {
    pub fn message(&self) -> &str {
        match self {
            Self::RetryableNetwork(m) | Self::PermanentRequest(m) => m,
        }
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetryableNetwork(m) => write!(f, "retryable network error: {}", m),
            Self::PermanentRequest(m) => write!(f, "permanent request error: {}", m),
        }
    }
}

/// A pending mutation awaiting delivery to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Stable id, sent as the idempotency key.
    pub id: String,
    /// Local sequence number; defines queue order.
    pub seq: u64,
    pub entity_type: String,
    pub entity_local_id: String,
    pub entity_remote_id: Option<String>,
    pub kind: OperationKind,
    /// Request body captured at enqueue time. Never edited afterwards.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<DeliveryError>,
    pub status: OperationStatus,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl QueuedOperation {
    pub fn store_key(&self) -> String {
        queue_key(self.seq)
    }

    /// Whether a delivery may be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OperationStatus::Pending => true,
            OperationStatus::FailedRetryable => self.next_retry_at.map_or(true, |at| at <= now),
            OperationStatus::InFlight | OperationStatus::FailedPermanent => false,
        }
    }
}

/// Zero-padded so lexical key order equals sequence order.
pub fn queue_key(seq: u64) -> String {
    format!("{}{:020}", SYNC_QUEUE_PREFIX, seq)
}

/// Phase reported by a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Syncing,
    Complete,
    Error,
}

/// Transient progress notification for UI subscribers. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusEvent {
    pub phase: SyncPhase,
    pub completed: usize,
    pub total: usize,
}

impl SyncStatusEvent {
    pub fn syncing(completed: usize, total: usize) -> Self {
        Self {
            phase: SyncPhase::Syncing,
            completed,
            total,
        }
    }

    pub fn finished(phase: SyncPhase, completed: usize, total: usize) -> Self {
        Self {
            phase,
            completed,
            total,
        }
    }
}

/// User-facing notice about a single operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncNotice {
    /// Local change was discarded in favour of the server copy.
    #[serde(rename_all = "camelCase")]
    Conflict {
        operation_id: String,
        entity_type: String,
        entity_local_id: String,
    },
    /// Server rejected the operation; it stays queued until dismissed.
    #[serde(rename_all = "camelCase")]
    PermanentFailure {
        operation_id: String,
        entity_type: String,
        entity_local_id: String,
        reason: String,
    },
}

/// Trigger source for drain cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Startup,
    Reconnect,
    Periodic,
    Manual,
}

/// Engine state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Draining,
    BackingOff { until: DateTime<Utc> },
}

/// Locally cached copy of an entity for offline reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntity {
    pub entity_type: String,
    pub local_id: String,
    pub remote_id: Option<String>,
    pub body: serde_json::Value,
    /// Set when the body is the server's copy.
    pub synced_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn op(status: OperationStatus, next_retry_at: Option<DateTime<Utc>>) -> QueuedOperation {
        QueuedOperation {
            id: "op-1".to_string(),
            seq: 7,
            entity_type: "batch".to_string(),
            entity_local_id: "tmp-1".to_string(),
            entity_remote_id: None,
            kind: OperationKind::Create,
            payload: serde_json::json!({ "grade": "M30" }),
            created_at: Utc::now(),
            attempt_count: 0,
            last_error: None,
            status,
            next_retry_at,
        }
    }

    #[test]
    fn queue_keys_sort_by_sequence() {
        assert!(queue_key(9) < queue_key(10));
        assert_eq!(queue_key(7), op(OperationStatus::Pending, None).store_key());
    }

    #[test]
    fn due_respects_retry_deadline() {
        let now = Utc::now();
        assert!(op(OperationStatus::Pending, None).is_due(now));
        assert!(op(OperationStatus::FailedRetryable, Some(now - Duration::seconds(1))).is_due(now));
        assert!(!op(OperationStatus::FailedRetryable, Some(now + Duration::seconds(5))).is_due(now));
        assert!(!op(OperationStatus::InFlight, None).is_due(now));
        assert!(!op(OperationStatus::FailedPermanent, None).is_due(now));
    }

    #[test]
    fn serialization_matches_store_contract() {
        let mut entry = op(OperationStatus::FailedRetryable, None);
        entry.last_error = Some(DeliveryError::RetryableNetwork("HTTP 503".to_string()));
        let json = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(json["entityLocalId"], "tmp-1");
        assert_eq!(json["status"], "failed_retryable");
        assert_eq!(json["kind"], "create");
        assert_eq!(json["lastError"]["kind"], "retryable_network");

        let back: QueuedOperation = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, entry);
    }

    #[test]
    fn delivery_errors_carry_kind_and_message() {
        let retryable = DeliveryError::RetryableNetwork("HTTP 503".to_string());
        let permanent = DeliveryError::PermanentRequest("HTTP 422".to_string());
        assert_eq!(retryable.message(), "HTTP 503");
        assert_eq!(permanent.to_string(), "permanent request error: HTTP 422");

        let json = serde_json::to_value(&permanent).expect("serialize");
        assert_eq!(json["kind"], "permanent_request");
        assert!(serde_json::from_value::<DeliveryError>(
            serde_json::json!({ "kind": "conflict", "message": "stale" })
        )
        .is_err());
    }

    #[test]
    fn notice_serialization_is_tagged() {
        let notice = SyncNotice::Conflict {
            operation_id: "op-1".to_string(),
            entity_type: "batch".to_string(),
            entity_local_id: "tmp-1".to_string(),
        };
        let json = serde_json::to_value(&notice).expect("serialize");
        assert_eq!(json["type"], "conflict");
        assert_eq!(json["operationId"], "op-1");
    }
}
