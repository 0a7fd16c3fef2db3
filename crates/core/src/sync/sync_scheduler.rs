//! Scheduler constants for the background sync loop.

/// Periodic drain cadence in seconds while online with pending work.
pub const SYNC_PERIODIC_INTERVAL_SECS: u64 = 30;

/// Maximum jitter (seconds) added to periodic cycle intervals.
pub const SYNC_INTERVAL_JITTER_SECS: u64 = 5;

/// Per-request network timeout in seconds.
pub const SYNC_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Entries fetched per `peek_next_batch` call.
pub const SYNC_BATCH_SIZE: usize = 50;

/// Upper bound on concurrent in-flight requests across distinct entities.
pub const SYNC_MAX_CONCURRENCY: usize = 4;
