//! Key/value table implementing the core `DurableStore` contract.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;
use std::path::Path;
use std::sync::Arc;

use sitesync_core::errors::StoreError;
use sitesync_core::store::{DurableStore, StoreResult};

use crate::db::{self, get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::kv_entries;

#[derive(Queryable, Insertable, Selectable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = crate::schema::kv_entries)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct KvEntryDB {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

/// Exclusive upper bound for keys starting with `prefix` under SQLite's
/// binary collation.
fn prefix_upper_bound(prefix: &str) -> String {
    format!("{}{}", prefix, char::MAX)
}

/// Durable store backed by one SQLite file.
///
/// Reads go through the pool on the blocking thread pool; writes are
/// serialised through a single writer connection.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path` and apply pending
    /// migrations.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db_url = db::init(db_path.as_ref())?;
        db::run_migrations(&db_url)?;
        let pool = db::create_pool(&db_url)?;
        let writer = db::spawn_writer(Arc::clone(&pool))?;
        debug!("[SqliteStore] Opened {}", db_url);
        Ok(Self { pool, writer })
    }

    async fn read<F, T>(&self, job: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let mut conn = get_connection(&pool)?;
            job(&mut *conn)
        })
        .await?
    }

    pub async fn entry_count(&self) -> Result<i64, StorageError> {
        self.read(|conn| {
            kv_entries::table
                .count()
                .get_result::<i64>(conn)
                .map_err(StorageError::from)
        })
        .await
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        self.read(move |conn| {
            kv_entries::table
                .find(key)
                .select(kv_entries::value)
                .first::<String>(conn)
                .optional()
                .map_err(StorageError::from)
        })
        .await
        .map_err(StoreError::from)
    }

    async fn put(&self, key: &str, value: String) -> StoreResult<()> {
        let row = KvEntryDB {
            key: key.to_string(),
            value,
            updated_at: Utc::now().to_rfc3339(),
        };
        self.writer
            .exec(move |conn| {
                diesel::replace_into(kv_entries::table)
                    .values(&row)
                    .execute(conn)?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.writer
            .exec(move |conn| {
                diesel::delete(kv_entries::table.find(key)).execute(conn)?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    async fn list_by_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let lower = prefix.to_string();
        let upper = prefix_upper_bound(prefix);
        self.read(move |conn| {
            let rows = kv_entries::table
                .filter(kv_entries::key.ge(&lower))
                .filter(kv_entries::key.lt(&upper))
                .order(kv_entries::key.asc())
                .select((kv_entries::key, kv_entries::value))
                .load::<(String, String)>(conn)?;
            Ok(rows
                .into_iter()
                .filter(|(key, _)| key.starts_with(&lower))
                .collect())
        })
        .await
        .map_err(StoreError::from)
    }
}
