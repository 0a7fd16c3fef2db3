//! Core of the site QA sync engine: durable queue, delivery and status.

pub mod errors;
pub mod store;
pub mod sync;

pub use errors::{Result, StoreError, SyncError};
pub use store::{DurableStore, MemoryStore};
