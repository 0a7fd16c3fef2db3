//! Offline mutation sync: queue, delivery engine and UI notifications.

mod broadcaster;
mod config;
mod connectivity;
mod engine;
mod entity_cache;
mod queue;
mod queue_model;
mod remote;
mod retry_policy;
mod sync_scheduler;

pub use broadcaster::*;
pub use config::*;
pub use connectivity::*;
pub use engine::*;
pub use entity_cache::*;
pub use queue::*;
pub use queue_model::*;
pub use remote::*;
pub use retry_policy::*;
pub use sync_scheduler::*;
