//! REST client turning queued operations into backend calls.
//!
//! Each operation maps to one request carrying its id as `Idempotency-Key`,
//! so a retry after an ambiguous timeout is applied at most once.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use std::sync::RwLock;

use sitesync_core::sync::{
    OperationKind, Outcome, QueuedOperation, RemoteApi, RetryClass, ServerEntity,
};

use crate::config::RemoteApiConfig;
use crate::error::{RemoteApiError, Result};

const MAX_LOG_BODY_CHARS: usize = 512;
const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

fn body_preview(body: &str) -> String {
    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    preview
}

/// Raw response before classification.
#[derive(Debug)]
struct RawResponse {
    status: u16,
    body: String,
}

/// `RemoteApi` over the backend's REST endpoints.
#[derive(Debug)]
pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: String,
    remote_id_field: String,
    auth_token: RwLock<Option<String>>,
}

impl HttpRemoteApi {
    pub fn new(config: RemoteApiConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url,
            remote_id_field: config.remote_id_field,
            auth_token: RwLock::new(config.auth_token),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(RemoteApiConfig::from_env()?)
    }

    /// Replace the bearer token, e.g. after the app refreshed its session.
    pub fn set_auth_token(&self, token: Option<String>) {
        if let Ok(mut slot) = self.auth_token.write() {
            *slot = token;
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, op: &QueuedOperation) -> Result<(Method, String)> {
        let collection = format!("{}/{}", self.base_url, op.entity_type);
        match op.kind {
            OperationKind::Create => Ok((Method::POST, collection)),
            OperationKind::Update | OperationKind::Delete => {
                let remote_id = op.entity_remote_id.as_deref().ok_or_else(|| {
                    RemoteApiError::invalid_request(format!(
                        "{:?} of {}/{} has no remote id",
                        op.kind, op.entity_type, op.entity_local_id
                    ))
                })?;
                let method = if op.kind == OperationKind::Update {
                    Method::PUT
                } else {
                    Method::DELETE
                };
                Ok((method, format!("{}/{}", collection, remote_id)))
            }
        }
    }

    fn headers(&self, op: &QueuedOperation) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let key = HeaderValue::from_str(&op.id)
            .map_err(|_| RemoteApiError::invalid_request("Invalid idempotency key format"))?;
        headers.insert(IDEMPOTENCY_KEY_HEADER, key);

        let token = self
            .auth_token
            .read()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(token) = token {
            let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| RemoteApiError::Auth("Invalid access token format".to_string()))?;
            headers.insert(AUTHORIZATION, auth_value);
        }
        Ok(headers)
    }

    async fn execute(&self, op: &QueuedOperation) -> Result<RawResponse> {
        let (method, url) = self.endpoint(op)?;
        let mut request = self
            .client
            .request(method.clone(), &url)
            .headers(self.headers(op)?);
        if op.kind != OperationKind::Delete {
            request = request.body(serde_json::to_vec(&op.payload)?);
        }

        debug!("[RemoteApi] {} {} (key {})", method, url, op.id);
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        if !(200..300).contains(&status) {
            debug!(
                "[RemoteApi] Response error ({}): {}",
                status,
                body_preview(&body)
            );
        }
        Ok(RawResponse { status, body })
    }

    /// Server id from a response body: the configured field, numbers
    /// stringified.
    pub fn extract_remote_id(&self, body: &serde_json::Value) -> Option<String> {
        match body.get(&self.remote_id_field)? {
            serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
            serde_json::Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    fn server_entity(&self, body: serde_json::Value) -> ServerEntity {
        ServerEntity::new(self.extract_remote_id(&body), body)
    }

    fn classify(&self, op: &QueuedOperation, response: RawResponse) -> Outcome {
        let RawResponse { status, body } = response;
        if (200..300).contains(&status) {
            if body.trim().is_empty() {
                return Outcome::Success(ServerEntity::empty());
            }
            return match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(value) => Outcome::Success(self.server_entity(value)),
                Err(err) => {
                    warn!(
                        "[RemoteApi] {} accepted with unreadable body: {}",
                        op.id, err
                    );
                    Outcome::Success(ServerEntity::empty())
                }
            };
        }

        let message = format!("HTTP {}: {}", status, body_preview(&body));
        match RemoteApiError::api(status, message.clone()).retry_class() {
            RetryClass::Conflict => match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(value) if !value.is_null() => Outcome::Conflict(self.server_entity(value)),
                _ => Outcome::PermanentFailure(format!(
                    "conflict without a readable server copy ({})",
                    message
                )),
            },
            RetryClass::Retryable | RetryClass::ReauthRequired => {
                Outcome::RetryableFailure(message)
            }
            RetryClass::Permanent => Outcome::PermanentFailure(message),
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn send(&self, operation: &QueuedOperation) -> Outcome {
        match self.execute(operation).await {
            Ok(response) => self.classify(operation, response),
            Err(err) => {
                warn!("[RemoteApi] {} failed: {}", operation.id, err);
                match err.retry_class() {
                    RetryClass::Retryable | RetryClass::ReauthRequired => {
                        Outcome::RetryableFailure(err.to_string())
                    }
                    RetryClass::Permanent | RetryClass::Conflict => {
                        Outcome::PermanentFailure(err.to_string())
                    }
                }
            }
        }
    }
}
