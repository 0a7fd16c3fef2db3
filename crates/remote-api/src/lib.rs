//! HTTP implementation of the sync engine's remote API.

mod client;
mod config;
mod error;

pub use client::HttpRemoteApi;
pub use config::{RemoteApiConfig, DEFAULT_REMOTE_ID_FIELD, DEFAULT_TIMEOUT_SECS};
pub use error::{RemoteApiError, Result};
