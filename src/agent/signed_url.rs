//! Where the agent WebSocket URL comes from
//! Signed URLs are single-use, so providers are asked again on every (re)connect.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::AgentError;

pub const ELEVENLABS_API_URL: &str = "https://api.elevenlabs.io";

#[async_trait]
pub trait SignedUrlProvider: Send + Sync {
    async fn signed_url(&self) -> Result<String, AgentError>;
}

/// Signed conversation URLs from the ElevenLabs API
pub struct ElevenLabsSignedUrl {
    http: Client,
    base_url: String,
    api_key: String,
    agent_id: String,
}

#[derive(Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

impl ElevenLabsSignedUrl {
    pub fn new(api_key: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self::with_base_url(ELEVENLABS_API_URL, api_key, agent_id)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            agent_id: agent_id.into(),
        }
    }

    pub fn request_url(&self) -> String {
        format!(
            "{}/v1/convai/conversation/get-signed-url?agent_id={}",
            self.base_url, self.agent_id
        )
    }
}

#[async_trait]
impl SignedUrlProvider for ElevenLabsSignedUrl {
    async fn signed_url(&self) -> Result<String, AgentError> {
        if self.api_key.is_empty() {
            return Err(AgentError::SignedUrl("agent API key not configured".into()));
        }
        if self.agent_id.is_empty() {
            return Err(AgentError::SignedUrl("agent id not configured".into()));
        }

        let response = self
            .http
            .get(self.request_url())
            .header("xi-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| AgentError::SignedUrl(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            tracing::error!("Signed URL request failed ({}): {}", status, details);
            return Err(AgentError::SignedUrl(format!("HTTP {}", status.as_u16())));
        }

        let body: SignedUrlResponse = response
            .json()
            .await
            .map_err(|e| AgentError::SignedUrl(e.to_string()))?;
        tracing::info!("Agent signed URL obtained");
        Ok(body.signed_url)
    }
}

/// A fixed URL (public agents, local servers)
pub struct StaticUrl(pub String);

#[async_trait]
impl SignedUrlProvider for StaticUrl {
    async fn signed_url(&self) -> Result<String, AgentError> {
        Ok(self.0.clone())
    }
}
