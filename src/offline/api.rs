//! Backend API Client - HTTP transport used by operation processors
//!
//! Every call is authenticated with a bearer token fetched from a
//! `TokenProvider` at call time, since tokens may expire between retries.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::config::ApiConfig;

/// Supplies a bearer token for each backend call
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, ApiError>;
}

/// In-memory token cache updated by the host's auth flow
#[derive(Default, Clone)]
pub struct TokenStore {
    access_token: Arc<RwLock<Option<String>>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set access token (after login or refresh)
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear token (logout)
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }
}

#[async_trait]
impl TokenProvider for TokenStore {
    async fn access_token(&self) -> Result<String, ApiError> {
        self.get_token().await.ok_or(ApiError::Unauthorized)
    }
}

/// HTTP client for the automation backend
pub struct BackendClient {
    client: Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send an authenticated JSON request
    ///
    /// `idempotency_key` lets the backend deduplicate a retried operation.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        token: &str,
        idempotency_key: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        log::debug!("{} {}", method, url);

        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(token)
            .header("Idempotency-Key", idempotency_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        handle_response(response).await
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid response from server")]
    InvalidResponse,
}

/// Decode a successful response; empty bodies become `Value::Null`
async fn handle_response(response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();

    if !status.is_success() {
        return Err(handle_error(response).await);
    }
    if status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }

    let text = response.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|_| ApiError::InvalidResponse)
}

/// Convert error response to ApiError
async fn handle_error(response: reqwest::Response) -> ApiError {
    let status = response.status();
    let msg = response
        .text()
        .await
        .ok()
        .and_then(|body| extract_error_message(&body))
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::FORBIDDEN => ApiError::Forbidden,
        StatusCode::NOT_FOUND => ApiError::NotFound(msg),
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimitExceeded,
        s if s.is_server_error() => ApiError::ServerError(msg),
        _ => ApiError::Rejected(format!("{}: {}", status, msg)),
    }
}

/// Pull `error`/`message` out of a JSON error body, else the raw text
fn extract_error_message(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(json) => json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(body.to_string())),
        Err(_) => Some(body.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================
