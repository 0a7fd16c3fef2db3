//! Mutation queue manager: the only writer of sync queue entries.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{Result, SyncError};
use crate::store::DurableStore;

use super::queue_model::{
    DeliveryError, OperationKind, OperationStatus, QueuedOperation, SYNC_QUEUE_PREFIX,
};
use super::retry_policy::RetryPolicy;

/// Input for [`MutationQueue::enqueue_request`].
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub entity_type: String,
    pub entity_local_id: String,
    pub entity_remote_id: Option<String>,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
}

impl EnqueueRequest {
    pub fn new(
        entity_type: impl Into<String>,
        entity_local_id: impl Into<String>,
        kind: OperationKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_local_id: entity_local_id.into(),
            entity_remote_id: None,
            kind,
            payload,
        }
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.entity_remote_id = Some(remote_id.into());
        self
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: BTreeMap<u64, QueuedOperation>,
    by_id: HashMap<String, u64>,
    next_seq: u64,
    last_created_at: Option<DateTime<Utc>>,
}

impl QueueState {
    fn find(&self, id: &str) -> Result<&QueuedOperation> {
        self.by_id
            .get(id)
            .and_then(|seq| self.entries.get(seq))
            .ok_or_else(|| SyncError::OperationNotFound(id.to_string()))
    }

    fn insert(&mut self, op: QueuedOperation) {
        self.by_id.insert(op.id.clone(), op.seq);
        self.entries.insert(op.seq, op);
    }

    fn remove(&mut self, id: &str) -> Option<QueuedOperation> {
        let seq = self.by_id.remove(id)?;
        self.entries.remove(&seq)
    }

    fn known_remote_id(&self, entity_type: &str, local_id: &str) -> Option<String> {
        self.entries
            .values()
            .rev()
            .filter(|op| op.entity_type == entity_type && op.entity_local_id == local_id)
            .find_map(|op| op.entity_remote_id.clone())
    }
}

/// Durable, ordered queue of pending mutations.
///
/// Keeps an in-memory mirror of the stored entries; every change is written
/// to the store before the mirror is updated and before the call returns.
pub struct MutationQueue {
    store: Arc<dyn DurableStore>,
    policy: RetryPolicy,
    state: Mutex<QueueState>,
}

impl MutationQueue {
    /// Load the queue from `store`.
    ///
    /// Entries still marked in-flight were interrupted with an unknown outcome;
    /// they are reset to retryable so the same idempotency key is sent again.
    pub async fn open(store: Arc<dyn DurableStore>, policy: RetryPolicy) -> Result<Self> {
        let rows = store.list_by_prefix(SYNC_QUEUE_PREFIX).await?;
        let mut state = QueueState {
            next_seq: 1,
            ..QueueState::default()
        };

        for (key, value) in rows {
            let op: QueuedOperation = serde_json::from_str(&value)?;
            if op.store_key() != key {
                warn!(
                    "[SyncQueue] Entry {} stored under unexpected key {}",
                    op.id, key
                );
            }
            state.next_seq = state.next_seq.max(op.seq + 1);
            state.last_created_at = Some(
                state
                    .last_created_at
                    .map_or(op.created_at, |at| at.max(op.created_at)),
            );
            state.insert(op);
        }

        debug!(
            "[SyncQueue] Opened queue with {} entries (next_seq={})",
            state.entries.len(),
            state.next_seq
        );

        let queue = Self {
            store,
            policy,
            state: Mutex::new(state),
        };
        queue.recover_in_flight().await?;
        Ok(queue)
    }

    /// Reset entries left in flight by an interrupted delivery to retryable.
    ///
    /// Callers must ensure no delivery is running. Returns the number of
    /// entries recovered.
    pub async fn recover_in_flight(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let stuck: Vec<QueuedOperation> = state
            .entries
            .values()
            .filter(|op| op.status == OperationStatus::InFlight)
            .cloned()
            .collect();

        let recovered = stuck.len();
        for mut op in stuck {
            op.status = OperationStatus::FailedRetryable;
            op.next_retry_at = None;
            op.last_error = Some(DeliveryError::RetryableNetwork(
                "delivery interrupted before an outcome was received".to_string(),
            ));
            self.persist(&op).await?;
            info!("[SyncQueue] Recovered interrupted operation {}", op.id);
            state.insert(op);
        }
        Ok(recovered)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn persist(&self, op: &QueuedOperation) -> Result<()> {
        let value = serde_json::to_string(op)?;
        self.store.put(&op.store_key(), value).await?;
        Ok(())
    }

    /// Record a new mutation. Returns only after the entry is durable.
    pub async fn enqueue(
        &self,
        entity_type: &str,
        entity_local_id: &str,
        kind: OperationKind,
        payload: serde_json::Value,
    ) -> Result<QueuedOperation> {
        self.enqueue_request(EnqueueRequest::new(
            entity_type,
            entity_local_id,
            kind,
            payload,
        ))
        .await
    }

    pub async fn enqueue_request(&self, request: EnqueueRequest) -> Result<QueuedOperation> {
        if request.entity_type.trim().is_empty() {
            return Err(SyncError::invalid_request("entity type must not be empty"));
        }
        if request.entity_local_id.trim().is_empty() {
            return Err(SyncError::invalid_request(
                "entity local id must not be empty",
            ));
        }

        let mut state = self.state.lock().await;

        // Wall clocks can step backwards; keep created_at monotonic with seq.
        let now = Utc::now();
        let created_at = state.last_created_at.map_or(now, |last| last.max(now));
        let entity_remote_id = request.entity_remote_id.or_else(|| {
            state.known_remote_id(&request.entity_type, &request.entity_local_id)
        });

        let op = QueuedOperation {
            id: Uuid::now_v7().to_string(),
            seq: state.next_seq,
            entity_type: request.entity_type,
            entity_local_id: request.entity_local_id,
            entity_remote_id,
            kind: request.kind,
            payload: request.payload,
            created_at,
            attempt_count: 0,
            last_error: None,
            status: OperationStatus::Pending,
            next_retry_at: None,
        };

        self.persist(&op).await?;

        state.next_seq += 1;
        state.last_created_at = Some(created_at);
        state.insert(op.clone());

        debug!(
            "[SyncQueue] Enqueued {} {:?} {}/{}",
            op.id, op.kind, op.entity_type, op.entity_local_id
        );
        Ok(op)
    }

    /// Oldest deliverable entries, at most `max_count`.
    ///
    /// An entity is skipped from its first entry that is in flight or still
    /// backing off, so later entries for it never overtake an unresolved one.
    /// Permanently failed entries neither deliver nor block.
    pub async fn peek_next_batch(&self, max_count: usize) -> Vec<QueuedOperation> {
        self.peek_next_batch_at(max_count, Utc::now()).await
    }

    pub async fn peek_next_batch_at(
        &self,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> Vec<QueuedOperation> {
        let state = self.state.lock().await;
        let mut blocked: HashSet<(&str, &str)> = HashSet::new();
        let mut batch = Vec::new();

        for op in state.entries.values() {
            if batch.len() >= max_count {
                break;
            }
            if op.status == OperationStatus::FailedPermanent {
                continue;
            }
            let entity = (op.entity_type.as_str(), op.entity_local_id.as_str());
            if blocked.contains(&entity) {
                continue;
            }
            if op.is_due(now) {
                batch.push(op.clone());
            } else {
                blocked.insert(entity);
            }
        }
        batch
    }

    pub async fn mark_in_flight(&self, id: &str) -> Result<QueuedOperation> {
        let mut state = self.state.lock().await;
        let mut op = state.find(id)?.clone();
        match op.status {
            OperationStatus::Pending | OperationStatus::FailedRetryable => {}
            other => {
                return Err(SyncError::invalid_transition(
                    id,
                    format!("cannot start delivery from {:?}", other),
                ))
            }
        }
        op.status = OperationStatus::InFlight;
        self.persist(&op).await?;
        state.insert(op.clone());
        Ok(op)
    }

    /// Remove a delivered entry and propagate a newly learned remote id to the
    /// entity's remaining entries.
    pub async fn mark_succeeded(
        &self,
        id: &str,
        remote_id: Option<String>,
    ) -> Result<QueuedOperation> {
        let removed = self.remove_resolved(id, remote_id).await?;
        debug!("[SyncQueue] Delivered {}", removed.id);
        Ok(removed)
    }

    /// Remove an entry whose local payload lost to the server copy.
    pub async fn mark_conflicted(
        &self,
        id: &str,
        remote_id: Option<String>,
    ) -> Result<QueuedOperation> {
        let removed = self.remove_resolved(id, remote_id).await?;
        info!(
            "[SyncQueue] Discarded {} for {}/{} after conflict",
            removed.id, removed.entity_type, removed.entity_local_id
        );
        Ok(removed)
    }

    async fn remove_resolved(
        &self,
        id: &str,
        remote_id: Option<String>,
    ) -> Result<QueuedOperation> {
        let mut state = self.state.lock().await;
        let op = state.find(id)?.clone();

        self.store.delete(&op.store_key()).await?;
        state.remove(id);

        if let Some(remote_id) = remote_id {
            let siblings: Vec<QueuedOperation> = state
                .entries
                .values()
                .filter(|other| {
                    other.entity_type == op.entity_type
                        && other.entity_local_id == op.entity_local_id
                        && other.entity_remote_id.as_deref() != Some(remote_id.as_str())
                })
                .cloned()
                .collect();
            for mut sibling in siblings {
                sibling.entity_remote_id = Some(remote_id.clone());
                self.persist(&sibling).await?;
                state.insert(sibling);
            }
        }
        Ok(op)
    }

    /// Record a failed attempt.
    ///
    /// Retryable failures get a backoff deadline until the attempt ceiling is
    /// reached, after which the entry becomes permanently failed.
    pub async fn mark_failed(
        &self,
        id: &str,
        error: DeliveryError,
        retryable: bool,
    ) -> Result<QueuedOperation> {
        let mut state = self.state.lock().await;
        let mut op = state.find(id)?.clone();
        if op.status == OperationStatus::FailedPermanent {
            return Err(SyncError::invalid_transition(
                id,
                "entry already failed permanently",
            ));
        }

        op.attempt_count = op.attempt_count.saturating_add(1);
        op.last_error = Some(error);
        if retryable && !self.policy.is_exhausted(op.attempt_count) {
            op.status = OperationStatus::FailedRetryable;
            op.next_retry_at = Some(self.policy.next_retry_at(op.attempt_count, Utc::now()));
        } else {
            if retryable {
                warn!(
                    "[SyncQueue] {} exhausted {} attempts; marking permanent",
                    op.id, op.attempt_count
                );
            }
            op.status = OperationStatus::FailedPermanent;
            op.next_retry_at = None;
        }

        self.persist(&op).await?;
        state.insert(op.clone());
        Ok(op)
    }

    /// Undelivered entries (pending, in flight, retryable). Drives the badge.
    pub async fn count(&self) -> usize {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|op| op.status.is_undelivered())
            .count()
    }

    /// Every entry in queue order, including permanent failures.
    pub async fn list(&self) -> Vec<QueuedOperation> {
        let state = self.state.lock().await;
        state.entries.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<QueuedOperation> {
        let state = self.state.lock().await;
        state.find(id).ok().cloned()
    }

    pub async fn failed_permanent(&self) -> Vec<QueuedOperation> {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|op| op.status == OperationStatus::FailedPermanent)
            .cloned()
            .collect()
    }

    /// Earliest backoff deadline among retryable entries.
    pub async fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|op| op.status == OperationStatus::FailedRetryable)
            .filter_map(|op| op.next_retry_at)
            .min()
    }

    /// User acknowledged a permanent failure; drop it from the queue.
    pub async fn dismiss(&self, id: &str) -> Result<QueuedOperation> {
        let mut state = self.state.lock().await;
        let op = state.find(id)?.clone();
        if op.status != OperationStatus::FailedPermanent {
            return Err(SyncError::invalid_transition(
                id,
                "only permanently failed entries can be dismissed",
            ));
        }
        self.store.delete(&op.store_key()).await?;
        state.remove(id);
        info!("[SyncQueue] Dismissed failed operation {}", op.id);
        Ok(op)
    }

    /// User asked to try a permanently failed entry again.
    pub async fn requeue(&self, id: &str) -> Result<QueuedOperation> {
        let mut state = self.state.lock().await;
        let mut op = state.find(id)?.clone();
        if op.status != OperationStatus::FailedPermanent {
            return Err(SyncError::invalid_transition(
                id,
                "only permanently failed entries can be requeued",
            ));
        }
        op.status = OperationStatus::Pending;
        op.next_retry_at = None;
        self.persist(&op).await?;
        state.insert(op.clone());
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::store::MemoryStore;
    use chrono::Duration;
    use serde_json::json;

    async fn open(store: &MemoryStore) -> MutationQueue {
        MutationQueue::open(Arc::new(store.clone()), RetryPolicy::default())
            .await
            .expect("open queue")
    }

    fn ids(batch: &[QueuedOperation]) -> Vec<String> {
        batch.iter().map(|op| op.id.clone()).collect()
    }

    #[tokio::test]
    async fn enqueue_persists_before_returning() {
        let store = MemoryStore::new();
        let queue = open(&store).await;

        let op = queue
            .enqueue("cubeTestResult", "tmp-7", OperationKind::Create, json!({ "mpa": 31.5 }))
            .await
            .expect("enqueue");

        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.attempt_count, 0);
        let stored = store.get(&op.store_key()).await.unwrap().expect("stored");
        let decoded: QueuedOperation = serde_json::from_str(&stored).unwrap();
        assert_eq!(decoded, op);
    }

    #[tokio::test]
    async fn enqueue_surfaces_storage_failure() {
        let store = MemoryStore::with_capacity_limit(0);
        let queue = open(&store).await;

        let err = queue
            .enqueue("batch", "tmp-1", OperationKind::Create, json!({}))
            .await
            .expect_err("quota");
        assert!(matches!(
            err,
            SyncError::LocalStorage(StoreError::QuotaExceeded)
        ));
        assert_eq!(queue.count().await, 0);
    }

    #[tokio::test]
    async fn enqueue_rejects_blank_identity() {
        let queue = open(&MemoryStore::new()).await;
        let err = queue
            .enqueue("batch", " ", OperationKind::Update, json!({}))
            .await
            .expect_err("blank id");
        assert!(matches!(err, SyncError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn ids_and_order_are_stable() {
        let queue = open(&MemoryStore::new()).await;
        let a = queue.enqueue("batch", "b1", OperationKind::Create, json!({})).await.unwrap();
        let b = queue.enqueue("batch", "b1", OperationKind::Update, json!({})).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.seq < b.seq);
        assert!(a.created_at <= b.created_at);
    }

    #[tokio::test]
    async fn peek_skips_entity_with_entry_in_flight() {
        let queue = open(&MemoryStore::new()).await;
        let a1 = queue.enqueue("batch", "a", OperationKind::Create, json!({})).await.unwrap();
        let a2 = queue.enqueue("batch", "a", OperationKind::Update, json!({})).await.unwrap();
        let b1 = queue.enqueue("batch", "b", OperationKind::Create, json!({})).await.unwrap();

        assert_eq!(
            ids(&queue.peek_next_batch(10).await),
            vec![a1.id.clone(), a2.id.clone(), b1.id.clone()]
        );

        queue.mark_in_flight(&a1.id).await.unwrap();
        assert_eq!(ids(&queue.peek_next_batch(10).await), vec![b1.id.clone()]);
    }

    #[tokio::test]
    async fn peek_skips_entity_that_is_backing_off() {
        let queue = open(&MemoryStore::new()).await;
        let a1 = queue.enqueue("batch", "a", OperationKind::Update, json!({})).await.unwrap();
        let a2 = queue.enqueue("batch", "a", OperationKind::Update, json!({})).await.unwrap();

        queue.mark_in_flight(&a1.id).await.unwrap();
        let failed = queue
            .mark_failed(&a1.id, DeliveryError::RetryableNetwork("503".into()), true)
            .await
            .unwrap();
        assert!(queue.peek_next_batch(10).await.is_empty());

        let after_deadline = failed.next_retry_at.unwrap() + Duration::milliseconds(1);
        assert_eq!(
            ids(&queue.peek_next_batch_at(10, after_deadline).await),
            vec![a1.id, a2.id]
        );
    }

    #[tokio::test]
    async fn permanent_failure_does_not_block_entity() {
        let queue = open(&MemoryStore::new()).await;
        let a1 = queue.enqueue("batch", "a", OperationKind::Update, json!({})).await.unwrap();
        let a2 = queue.enqueue("batch", "a", OperationKind::Update, json!({})).await.unwrap();

        queue.mark_in_flight(&a1.id).await.unwrap();
        queue
            .mark_failed(&a1.id, DeliveryError::PermanentRequest("422".into()), false)
            .await
            .unwrap();

        assert_eq!(ids(&queue.peek_next_batch(10).await), vec![a2.id]);
        assert_eq!(queue.failed_permanent().await.len(), 1);
        assert_eq!(queue.count().await, 1);
    }

    #[tokio::test]
    async fn peek_honours_max_count() {
        let queue = open(&MemoryStore::new()).await;
        for n in 0..5 {
            queue
                .enqueue("incident", &format!("i{n}"), OperationKind::Create, json!({}))
                .await
                .unwrap();
        }
        assert_eq!(queue.peek_next_batch(3).await.len(), 3);
    }

    #[tokio::test]
    async fn attempt_ceiling_demotes_to_permanent() {
        let store = MemoryStore::new();
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: std::time::Duration::ZERO,
            ..RetryPolicy::default()
        };
        let queue = MutationQueue::open(Arc::new(store), policy).await.unwrap();
        let op = queue.enqueue("permit", "p1", OperationKind::Create, json!({})).await.unwrap();

        let first = queue
            .mark_failed(&op.id, DeliveryError::RetryableNetwork("timeout".into()), true)
            .await
            .unwrap();
        assert_eq!(first.status, OperationStatus::FailedRetryable);
        assert_eq!(first.attempt_count, 1);

        let second = queue
            .mark_failed(&op.id, DeliveryError::RetryableNetwork("timeout".into()), true)
            .await
            .unwrap();
        assert_eq!(second.status, OperationStatus::FailedPermanent);
        assert_eq!(second.attempt_count, 2);
        assert!(second.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn success_removes_entry_and_records_remote_id() {
        let store = MemoryStore::new();
        let queue = open(&store).await;
        let create = queue.enqueue("batch", "tmp-1", OperationKind::Create, json!({})).await.unwrap();
        let update = queue.enqueue("batch", "tmp-1", OperationKind::Update, json!({})).await.unwrap();

        queue.mark_in_flight(&create.id).await.unwrap();
        queue.mark_succeeded(&create.id, Some("42".into())).await.unwrap();

        assert!(queue.get(&create.id).await.is_none());
        assert!(store.get(&create.store_key()).await.unwrap().is_none());
        let remaining = queue.get(&update.id).await.unwrap();
        assert_eq!(remaining.entity_remote_id.as_deref(), Some("42"));
        assert_eq!(remaining.payload, update.payload);

        let later = queue.enqueue("batch", "tmp-1", OperationKind::Delete, json!({})).await.unwrap();
        assert_eq!(later.entity_remote_id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn reopen_keeps_entries_and_recovers_in_flight() {
        let store = MemoryStore::new();
        let (op_id, pending_id) = {
            let queue = open(&store).await;
            let op = queue.enqueue("batch", "a", OperationKind::Create, json!({ "n": 1 })).await.unwrap();
            let pending = queue.enqueue("batch", "b", OperationKind::Create, json!({})).await.unwrap();
            queue.mark_in_flight(&op.id).await.unwrap();
            (op.id, pending.id)
        };

        let reopened = open(&store).await;
        let recovered = reopened.get(&op_id).await.expect("survived restart");
        assert_eq!(recovered.status, OperationStatus::FailedRetryable);
        assert!(reopened.get(&pending_id).await.is_some());
        assert_eq!(reopened.count().await, 2);

        let next = reopened.enqueue("batch", "c", OperationKind::Create, json!({})).await.unwrap();
        assert!(next.seq > recovered.seq);
    }

    #[tokio::test]
    async fn recover_in_flight_makes_entries_deliverable_again() {
        let queue = open(&MemoryStore::new()).await;
        let op = queue.enqueue("batch", "a", OperationKind::Update, json!({})).await.unwrap();
        queue.mark_in_flight(&op.id).await.unwrap();
        assert!(queue.peek_next_batch(10).await.is_empty());

        assert_eq!(queue.recover_in_flight().await.unwrap(), 1);
        assert_eq!(queue.recover_in_flight().await.unwrap(), 0);

        let recovered = queue.get(&op.id).await.unwrap();
        assert_eq!(recovered.status, OperationStatus::FailedRetryable);
        assert_eq!(recovered.attempt_count, 0);
        assert!(matches!(
            recovered.last_error,
            Some(DeliveryError::RetryableNetwork(_))
        ));
        assert_eq!(ids(&queue.peek_next_batch(10).await), vec![op.id]);
    }

    #[tokio::test]
    async fn dismiss_and_requeue_only_apply_to_permanent_failures() {
        let queue = open(&MemoryStore::new()).await;
        let op = queue.enqueue("batch", "a", OperationKind::Create, json!({})).await.unwrap();
        assert!(queue.dismiss(&op.id).await.is_err());

        queue
            .mark_failed(&op.id, DeliveryError::PermanentRequest("bad grade".into()), false)
            .await
            .unwrap();
        let requeued = queue.requeue(&op.id).await.unwrap();
        assert_eq!(requeued.status, OperationStatus::Pending);
        assert_eq!(requeued.attempt_count, 1);

        queue
            .mark_failed(&op.id, DeliveryError::PermanentRequest("bad grade".into()), false)
            .await
            .unwrap();
        queue.dismiss(&op.id).await.unwrap();
        assert!(queue.list().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let queue = open(&MemoryStore::new()).await;
        assert!(matches!(
            queue.mark_in_flight("missing").await,
            Err(SyncError::OperationNotFound(_))
        ));
    }
}
