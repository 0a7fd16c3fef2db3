//! Cached entity records for offline reads.

use chrono::Utc;
use log::debug;
use std::sync::Arc;

use crate::errors::Result;
use crate::store::DurableStore;

use super::queue_model::{CachedEntity, ENTITY_CACHE_PREFIX, ENTITY_REMOTE_INDEX_PREFIX};
use super::remote::ServerEntity;

fn entity_key(entity_type: &str, local_id: &str) -> String {
    format!("{}{}/{}", ENTITY_CACHE_PREFIX, entity_type, local_id)
}

fn remote_index_key(entity_type: &str, remote_id: &str) -> String {
    format!("{}{}/{}", ENTITY_REMOTE_INDEX_PREFIX, entity_type, remote_id)
}

/// Local copies of entities, addressable by local id and, once the server
/// has assigned one, by remote id.
#[derive(Clone)]
pub struct EntityCache {
    store: Arc<dyn DurableStore>,
}

impl EntityCache {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, entity_type: &str, local_id: &str) -> Result<Option<CachedEntity>> {
        match self.store.get(&entity_key(entity_type, local_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_by_remote_id(
        &self,
        entity_type: &str,
        remote_id: &str,
    ) -> Result<Option<CachedEntity>> {
        match self
            .store
            .get(&remote_index_key(entity_type, remote_id))
            .await?
        {
            Some(local_id) => self.get(entity_type, &local_id).await,
            None => Ok(None),
        }
    }

    /// All cached records of one type, ordered by local id.
    pub async fn list(&self, entity_type: &str) -> Result<Vec<CachedEntity>> {
        let prefix = format!("{}{}/", ENTITY_CACHE_PREFIX, entity_type);
        self.store
            .list_by_prefix(&prefix)
            .await?
            .into_iter()
            .map(|(_, raw)| serde_json::from_str(&raw).map_err(Into::into))
            .collect()
    }

    /// Optimistic local write, made by the app alongside an enqueue.
    pub async fn put_local(
        &self,
        entity_type: &str,
        local_id: &str,
        body: serde_json::Value,
    ) -> Result<CachedEntity> {
        let remote_id = self
            .get(entity_type, local_id)
            .await?
            .and_then(|existing| existing.remote_id);
        let record = CachedEntity {
            entity_type: entity_type.to_string(),
            local_id: local_id.to_string(),
            remote_id,
            body,
            synced_at: None,
        };
        self.write(&record).await?;
        Ok(record)
    }

    /// Replace the local copy with the server's and index its remote id.
    pub async fn apply_server_entity(
        &self,
        entity_type: &str,
        local_id: &str,
        server: &ServerEntity,
    ) -> Result<CachedEntity> {
        let previous = self.get(entity_type, local_id).await?;
        let remote_id = server
            .remote_id
            .clone()
            .or_else(|| previous.as_ref().and_then(|p| p.remote_id.clone()));
        let body = if server.body.is_null() {
            previous.map(|p| p.body).unwrap_or(serde_json::Value::Null)
        } else {
            server.body.clone()
        };

        let record = CachedEntity {
            entity_type: entity_type.to_string(),
            local_id: local_id.to_string(),
            remote_id,
            body,
            synced_at: Some(Utc::now()),
        };
        self.write(&record).await?;
        if let Some(remote_id) = &record.remote_id {
            self.store
                .put(
                    &remote_index_key(entity_type, remote_id),
                    local_id.to_string(),
                )
                .await?;
        }
        debug!(
            "[EntityCache] Stored server copy of {}/{} (remote_id={:?})",
            entity_type, local_id, record.remote_id
        );
        Ok(record)
    }

    pub async fn remove(&self, entity_type: &str, local_id: &str) -> Result<()> {
        if let Some(existing) = self.get(entity_type, local_id).await? {
            if let Some(remote_id) = existing.remote_id {
                self.store
                    .delete(&remote_index_key(entity_type, &remote_id))
                    .await?;
            }
        }
        self.store.delete(&entity_key(entity_type, local_id)).await?;
        Ok(())
    }

    async fn write(&self, record: &CachedEntity) -> Result<()> {
        let value = serde_json::to_string(record)?;
        self.store
            .put(&entity_key(&record.entity_type, &record.local_id), value)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn cache() -> EntityCache {
        EntityCache::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn server_copy_is_indexed_by_remote_id() {
        let cache = cache();
        cache
            .put_local("cubeTestResult", "tmp-7", json!({ "mpa": 30.1 }))
            .await
            .unwrap();

        let server = ServerEntity::new(Some("42".into()), json!({ "id": 42, "mpa": 30.1 }));
        cache
            .apply_server_entity("cubeTestResult", "tmp-7", &server)
            .await
            .unwrap();

        let by_local = cache.get("cubeTestResult", "tmp-7").await.unwrap().unwrap();
        let by_remote = cache
            .get_by_remote_id("cubeTestResult", "42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_local, by_remote);
        assert_eq!(by_local.remote_id.as_deref(), Some("42"));
        assert!(by_local.synced_at.is_some());
    }

    #[tokio::test]
    async fn empty_server_body_keeps_local_body() {
        let cache = cache();
        cache.put_local("batch", "b1", json!({ "grade": "M25" })).await.unwrap();
        cache
            .apply_server_entity("batch", "b1", &ServerEntity::new(None, serde_json::Value::Null))
            .await
            .unwrap();
        let record = cache.get("batch", "b1").await.unwrap().unwrap();
        assert_eq!(record.body, json!({ "grade": "M25" }));
    }

    #[tokio::test]
    async fn local_write_keeps_known_remote_id() {
        let cache = cache();
        cache
            .apply_server_entity("batch", "b1", &ServerEntity::new(Some("9".into()), json!({})))
            .await
            .unwrap();
        let updated = cache.put_local("batch", "b1", json!({ "grade": "M30" })).await.unwrap();
        assert_eq!(updated.remote_id.as_deref(), Some("9"));
        assert!(updated.synced_at.is_none());
    }

    #[tokio::test]
    async fn remove_drops_record_and_index() {
        let cache = cache();
        cache
            .apply_server_entity("permit", "p1", &ServerEntity::new(Some("5".into()), json!({})))
            .await
            .unwrap();
        cache.remove("permit", "p1").await.unwrap();
        assert!(cache.get("permit", "p1").await.unwrap().is_none());
        assert!(cache.get_by_remote_id("permit", "5").await.unwrap().is_none());
        assert!(cache.list("permit").await.unwrap().is_empty());
    }
}
