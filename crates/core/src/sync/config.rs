//! Engine configuration.

use std::time::Duration;

use crate::errors::{Result, SyncError};

use super::retry_policy::RetryPolicy;
use super::sync_scheduler::{
    SYNC_BATCH_SIZE, SYNC_INTERVAL_JITTER_SECS, SYNC_MAX_CONCURRENCY, SYNC_PERIODIC_INTERVAL_SECS,
    SYNC_REQUEST_TIMEOUT_SECS,
};

/// Tunables for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Entries fetched per batch.
    pub batch_size: usize,
    /// Maximum concurrent deliveries (distinct entities only).
    pub max_concurrency: usize,
    /// Periodic trigger interval.
    pub periodic_interval: Duration,
    /// Upper bound of the random jitter added to the periodic interval.
    pub interval_jitter: Duration,
    /// Per-request timeout; expiry counts as a retryable failure.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: SYNC_BATCH_SIZE,
            max_concurrency: SYNC_MAX_CONCURRENCY,
            periodic_interval: Duration::from_secs(SYNC_PERIODIC_INTERVAL_SECS),
            interval_jitter: Duration::from_secs(SYNC_INTERVAL_JITTER_SECS),
            request_timeout: Duration::from_secs(SYNC_REQUEST_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    env_value(name)
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|_| SyncError::Config(format!("{} must be an integer, got '{}'", name, raw)))
        })
        .transpose()
}

impl SyncConfig {
    /// Defaults overridden by `SITESYNC_*` environment variables.
    ///
    /// Recognised: `SITESYNC_BATCH_SIZE`, `SITESYNC_MAX_CONCURRENCY`,
    /// `SITESYNC_INTERVAL_SECS`, `SITESYNC_JITTER_SECS`,
    /// `SITESYNC_REQUEST_TIMEOUT_SECS`, `SITESYNC_RETRY_BASE_MS`,
    /// `SITESYNC_RETRY_MAX_SECS`, `SITESYNC_MAX_ATTEMPTS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_u64("SITESYNC_BATCH_SIZE")? {
            config.batch_size = v as usize;
        }
        if let Some(v) = env_u64("SITESYNC_MAX_CONCURRENCY")? {
            config.max_concurrency = v as usize;
        }
        if let Some(v) = env_u64("SITESYNC_INTERVAL_SECS")? {
            config.periodic_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("SITESYNC_JITTER_SECS")? {
            config.interval_jitter = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("SITESYNC_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("SITESYNC_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("SITESYNC_RETRY_MAX_SECS")? {
            config.retry.max_delay = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("SITESYNC_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v as u32;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch size must be at least 1".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(SyncError::Config(
                "max concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(SyncError::Config(
                "retry base delay exceeds the retry cap".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_scheduler_constants() {
        let config = SyncConfig::default();
        assert_eq!(config.periodic_interval, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.retry.base_delay, Duration::from_secs(2));
        assert_eq!(config.retry.max_delay, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let config = SyncConfig {
            max_concurrency: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    // Single test touching the environment so parallel tests do not race.
    #[test]
    fn from_env_applies_overrides_and_rejects_garbage() {
        std::env::set_var("SITESYNC_MAX_CONCURRENCY", "2");
        std::env::set_var("SITESYNC_RETRY_BASE_MS", "500");
        let config = SyncConfig::from_env().expect("config");
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));

        std::env::set_var("SITESYNC_BATCH_SIZE", "lots");
        assert!(matches!(SyncConfig::from_env(), Err(SyncError::Config(_))));

        std::env::remove_var("SITESYNC_MAX_CONCURRENCY");
        std::env::remove_var("SITESYNC_RETRY_BASE_MS");
        std::env::remove_var("SITESYNC_BATCH_SIZE");
    }
}
