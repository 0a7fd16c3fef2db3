//! SQLite-backed durable store for the sync engine.

pub mod db;
pub mod errors;
mod kv;
pub mod schema;

pub use errors::StorageError;
pub use kv::{KvEntryDB, SqliteStore};
