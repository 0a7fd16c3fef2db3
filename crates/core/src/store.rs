//! Durable key-value store contract and an in-memory implementation.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::errors::StoreError;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistent key-value store used for the sync queue and cached entities.
///
/// Every method touches a single key (or reads a prefix) and must be atomic:
/// a reader never observes a partially written value.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn put(&self, key: &str, value: String) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn list_by_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>>;
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    entries: BTreeMap<String, String>,
    capacity: Option<usize>,
    unavailable: bool,
}

/// Process-local store backed by a `BTreeMap`.
///
/// Clones share the same map, so dropping every queue built on one clone and
/// opening a new one over another clone behaves like a process restart over
/// the same on-disk data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects new keys once `capacity` entries exist.
    pub fn with_capacity_limit(capacity: usize) -> Self {
        let store = Self::default();
        if let Ok(mut inner) = store.inner.lock() {
            inner.capacity = Some(capacity);
        }
        store
    }

    /// Toggle a simulated outage; every call fails with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_inner<T>(
        &self,
        f: impl FnOnce(&mut MemoryStoreInner) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::backend("Memory store lock is poisoned"))?;
        if inner.unavailable {
            return Err(StoreError::unavailable("memory store is offline"));
        }
        f(&mut inner)
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_inner(|inner| Ok(inner.entries.get(key).cloned()))
    }

    async fn put(&self, key: &str, value: String) -> StoreResult<()> {
        self.with_inner(|inner| {
            if let Some(capacity) = inner.capacity {
                if !inner.entries.contains_key(key) && inner.entries.len() >= capacity {
                    return Err(StoreError::QuotaExceeded);
                }
            }
            inner.entries.insert(key.to_string(), value);
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.with_inner(|inner| {
            inner.entries.remove(key);
            Ok(())
        })
    }

    async fn list_by_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        self.with_inner(|inner| {
            Ok(inner
                .entries
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect())
        })
    }
}
