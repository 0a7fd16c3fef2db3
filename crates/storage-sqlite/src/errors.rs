use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

use sitesync_core::errors::StoreError;

/// Failures of the SQLite layer, folded into [`StoreError`] at the trait
/// boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to open database: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Query failed: {0}")]
    Query(#[from] DieselError),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Database writer stopped")]
    WriterClosed,

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// SQLITE_FULL surfaces as an unclassified database error.
    pub fn is_disk_full(&self) -> bool {
        match self {
            StorageError::Query(DieselError::DatabaseError(DatabaseErrorKind::Unknown, info)) => {
                info.message()
                    .to_ascii_lowercase()
                    .contains("database or disk is full")
            }
            _ => false,
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        if err.is_disk_full() {
            return StoreError::QuotaExceeded;
        }
        match err {
            StorageError::Pool(_)
            | StorageError::Connection(_)
            | StorageError::WriterClosed
            | StorageError::Join(_) => StoreError::unavailable(err.to_string()),
            other => StoreError::backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_writer_maps_to_unavailable() {
        let err: StoreError = StorageError::WriterClosed.into();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn query_errors_map_to_backend() {
        let err: StoreError = StorageError::Query(DieselError::NotFound).into();
        assert!(matches!(err, StoreError::Backend(_)));
        let err: StoreError = StorageError::Migration("bad sql".into()).into();
        assert_eq!(err, StoreError::Backend("Migration failed: bad sql".into()));
    }
}
