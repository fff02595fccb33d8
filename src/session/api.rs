//! Avatar session HTTP API
//! Every response is wrapped as `{ "code": 1000, "data": { ... } }`; anything else is an error.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "https://api.liveavatar.com";

const SUCCESS_CODE: i64 = 1000;
const DEFAULT_ERROR_CODE: i64 = 500;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct SessionApiError {
    pub message: String,
    /// Provider error code, 500 when the provider gave none
    pub code: i64,
    /// HTTP status, absent when the request never got a response
    pub status: Option<u16>,
}

impl SessionApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: DEFAULT_ERROR_CODE,
            status: None,
        }
    }
}

/// Connection credentials returned by start-session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(alias = "room_url")]
    pub livekit_url: String,
    #[serde(alias = "room_token", default)]
    pub livekit_client_token: String,
    /// Seconds
    #[serde(default)]
    pub max_session_duration: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarPersona {
    pub voice_id: Option<String>,
    pub context_id: Option<String>,
    pub language: Option<String>,
}

/// Body of the token-minting request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub mode: String,
    pub avatar_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_persona: Option<AvatarPersona>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionToken {
    pub session_token: String,
    pub session_id: String,
}

#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn start_session(&self) -> Result<SessionInfo, SessionApiError>;
    async fn stop_session(&self) -> Result<(), SessionApiError>;
    async fn keep_alive(&self) -> Result<(), SessionApiError>;
}

/// Unwrap the `{code, data}` envelope
fn unwrap_envelope<T: DeserializeOwned>(status: u16, body: &[u8]) -> Result<T, SessionApiError> {
    let envelope: Value = serde_json::from_slice(body).map_err(|_| SessionApiError {
        message: format!("API request failed with status {}", status),
        code: DEFAULT_ERROR_CODE,
        status: Some(status),
    })?;

    let message = envelope
        .get("data")
        .and_then(|d| d.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let code = envelope.get("code").and_then(Value::as_i64);

    if !(200..300).contains(&status) {
        return Err(SessionApiError {
            message: message
                .unwrap_or_else(|| format!("API request failed with status {}", status)),
            code: code.unwrap_or(DEFAULT_ERROR_CODE),
            status: Some(status),
        });
    }

    if code != Some(SUCCESS_CODE) {
        return Err(SessionApiError::new(
            message.unwrap_or_else(|| "API request failed".to_string()),
        ));
    }

    let data = envelope.get("data").cloned().unwrap_or(Value::Null);
    serde_json::from_value(data)
        .map_err(|e| SessionApiError::new(format!("Unexpected API response: {}", e)))
}

/// Session API bound to one session token
pub struct SessionApiClient {
    http: Client,
    base_url: String,
    session_id: String,
    session_token: String,
}

impl SessionApiClient {
    pub fn new(base_url: impl Into<String>, session_id: impl Into<String>, session_token: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: session_id.into(),
            session_token: session_token.into(),
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, SessionApiError> {
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.session_token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!("Session API request {} failed: {}", path, e);
            SessionApiError::new("API request failed")
        })?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|_| SessionApiError::new("API request failed"))?;
        unwrap_envelope(status, &bytes)
    }
}

#[async_trait]
impl SessionApi for SessionApiClient {
    async fn start_session(&self) -> Result<SessionInfo, SessionApiError> {
        self.request(Method::POST, "/v1/sessions", None).await
    }

    async fn stop_session(&self) -> Result<(), SessionApiError> {
        let _: Value = self
            .request(
                Method::DELETE,
                "/v1/sessions",
                Some(serde_json::json!({ "session_id": self.session_id })),
            )
            .await?;
        Ok(())
    }

    async fn keep_alive(&self) -> Result<(), SessionApiError> {
        let _: Value = self
            .request(
                Method::POST,
                "/v1/sessions/keep-alive",
                Some(serde_json::json!({ "session_id": self.session_id })),
            )
            .await?;
        Ok(())
    }
}

/// Exchange the account API key for a session token
pub async fn mint_session_token(
    base_url: &str,
    api_key: &str,
    request: &TokenRequest,
) -> Result<SessionToken, SessionApiError> {
    let url = format!("{}/v1/sessions/token", base_url.trim_end_matches('/'));
    let response = Client::new()
        .post(&url)
        .header("X-API-KEY", api_key)
        .json(request)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|e| SessionApiError::new(format!("Failed to retrieve session token: {}", e)))?;

    let status = response.status().as_u16();
    let bytes = response
        .bytes()
        .await
        .map_err(|_| SessionApiError::new("Failed to retrieve session token"))?;
    let token: SessionToken = unwrap_envelope(status, &bytes)?;
    if token.session_token.is_empty() {
        return Err(SessionApiError::new("Failed to retrieve session token"));
    }
    tracing::info!("Minted session token for session {}", token.session_id);
    Ok(token)
}
