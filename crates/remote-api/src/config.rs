//! Client configuration.

use std::time::Duration;

use crate::error::{RemoteApiError, Result};

/// Default timeout for API requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// JSON field holding the server-assigned id in response bodies.
pub const DEFAULT_REMOTE_ID_FIELD: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteApiConfig {
    /// Base URL without trailing slash, e.g. `https://qa.example.com/api`.
    pub base_url: String,
    pub timeout: Duration,
    pub remote_id_field: String,
    /// Bearer token supplied by the embedding app, if any.
    pub auth_token: Option<String>,
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

impl RemoteApiConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            remote_id_field: DEFAULT_REMOTE_ID_FIELD.to_string(),
            auth_token: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_remote_id_field(mut self, field: impl Into<String>) -> Self {
        self.remote_id_field = field.into();
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Read `SITESYNC_API_URL` (required), `SITESYNC_API_TIMEOUT_SECS`,
    /// `SITESYNC_API_TOKEN` and `SITESYNC_REMOTE_ID_FIELD`.
    pub fn from_env() -> Result<Self> {
        let base_url = env_value("SITESYNC_API_URL").ok_or_else(|| {
            RemoteApiError::config("SITESYNC_API_URL not configured. Sync is disabled.")
        })?;
        let mut config = Self::new(&base_url);

        if let Some(raw) = env_value("SITESYNC_API_TIMEOUT_SECS") {
            let secs = raw.parse::<u64>().map_err(|_| {
                RemoteApiError::config(format!(
                    "SITESYNC_API_TIMEOUT_SECS must be an integer, got '{}'",
                    raw
                ))
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(field) = env_value("SITESYNC_REMOTE_ID_FIELD") {
            config.remote_id_field = field;
        }
        config.auth_token = env_value("SITESYNC_API_TOKEN");

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(RemoteApiError::config(format!(
                "API URL must start with http:// or https://, got '{}'",
                self.base_url
            )));
        }
        if self.timeout.is_zero() {
            return Err(RemoteApiError::config("API timeout must be positive"));
        }
        if self.remote_id_field.is_empty() {
            return Err(RemoteApiError::config("remote id field must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_trims_trailing_slash() {
        let config = RemoteApiConfig::new(" https://qa.example.com/api/ ");
        assert_eq!(config.base_url, "https://qa.example.com/api");
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(config.remote_id_field, "id");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(RemoteApiConfig::new("ftp://host").validate().is_err());
        assert!(RemoteApiConfig::new("http://host")
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(RemoteApiConfig::new("http://host")
            .with_remote_id_field("")
            .validate()
            .is_err());
    }

    // Single test so parallel tests never race on the process environment.
    #[test]
    fn from_env_reads_overrides() {
        std::env::remove_var("SITESYNC_API_URL");
        assert!(matches!(
            RemoteApiConfig::from_env(),
            Err(RemoteApiError::Config(_))
        ));

        std::env::set_var("SITESYNC_API_URL", "http://localhost:8080/v1/");
        std::env::set_var("SITESYNC_API_TIMEOUT_SECS", "3");
        std::env::set_var("SITESYNC_REMOTE_ID_FIELD", "uuid");
        std::env::set_var("SITESYNC_API_TOKEN", "secret");
        let config = RemoteApiConfig::from_env().expect("config");
        assert_eq!(config.base_url, "http://localhost:8080/v1");
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.remote_id_field, "uuid");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));

        std::env::set_var("SITESYNC_API_TIMEOUT_SECS", "soon");
        assert!(RemoteApiConfig::from_env().is_err());

        for name in [
            "SITESYNC_API_URL",
            "SITESYNC_API_TIMEOUT_SECS",
            "SITESYNC_REMOTE_ID_FIELD",
            "SITESYNC_API_TOKEN",
        ] {
            std::env::remove_var(name);
        }
    }
}
