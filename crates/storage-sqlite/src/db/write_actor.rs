//! Single writer thread owning one pooled connection.
//!
//! SQLite allows one writer at a time; funnelling every write through one
//! connection avoids `SQLITE_BUSY` between our own writers.

use diesel::sqlite::SqliteConnection;
use log::{debug, error};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::{get_connection, DbPool};
use crate::errors::StorageError;

type Job = Box<dyn FnOnce(&mut SqliteConnection) + Send + 'static>;

const WRITE_QUEUE_DEPTH: usize = 256;

#[derive(Clone)]
pub struct WriteHandle {
    sender: mpsc::Sender<Job>,
}

impl WriteHandle {
    /// Run `job` inside an immediate transaction on the writer connection.
    pub async fn exec<F, T>(&self, job: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let wrapped: Job = Box::new(move |conn: &mut SqliteConnection| {
            let result = conn.immediate_transaction(job);
            // The caller may have given up waiting; nothing to do then.
            let _ = reply_tx.send(result);
        });
        self.sender
            .send(wrapped)
            .await
            .map_err(|_| StorageError::WriterClosed)?;
        reply_rx.await.map_err(|_| StorageError::WriterClosed)?
    }
}

/// Start the writer thread. It exits once every handle is dropped.
pub fn spawn_writer(pool: Arc<DbPool>) -> Result<WriteHandle, StorageError> {
    let mut conn = get_connection(&pool)?;
    let (sender, mut receiver) = mpsc::channel::<Job>(WRITE_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("sitesync-sqlite-writer".to_string())
        .spawn(move || {
            debug!("[SqliteStore] Writer started");
            while let Some(job) = receiver.blocking_recv() {
                job(&mut *conn);
            }
            debug!("[SqliteStore] Writer stopped");
        })
        .map_err(|e| {
            error!("[SqliteStore] Could not spawn writer thread: {}", e);
            StorageError::Io(e)
        })?;

    Ok(WriteHandle { sender })
}
