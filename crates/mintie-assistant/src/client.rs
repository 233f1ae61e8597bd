use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};

use crate::{AssistantBackend, AssistantError, AssistantRequest};

const ASSISTANT_USER_AGENT: &str = "Mintie-Slack-Bot/1.0";

#[derive(Debug, Clone)]
/// Connection settings for one workspace's assistant deployment.
pub struct AssistantConfig {
    /// Base URL up to and including the deployment segment, e.g.
    /// `https://api-dsc.mintlify.com/v1/assistant/acme`.
    pub api_base: String,
    pub api_key: String,
    pub request_timeout_ms: u64,
}

#[derive(Clone)]
/// HTTP client for the assistant `/message` endpoint.
pub struct AssistantHttpClient {
    http: reqwest::Client,
    api_base: String,
}

impl AssistantHttpClient {
    pub fn new(config: AssistantConfig) -> Result<Self, AssistantError> {
        if config.api_key.trim().is_empty() {
            return Err(AssistantError::MissingApiKey);
        }

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(ASSISTANT_USER_AGENT));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(config.api_key.trim()).map_err(|error| {
                AssistantError::InvalidConfig(format!("invalid API key header: {error}"))
            })?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AssistantBackend for AssistantHttpClient {
    async fn send(&self, request: &AssistantRequest) -> Result<String, AssistantError> {
        let response = self
            .http
            .post(format!("{}/message", self.api_base))
            .json(request)
            .send()
            .await?;

        // Error bodies are still answer material: the caller runs the parser
        // over whatever text came back and degrades from there.
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            tracing::warn!(
                status = status.as_u16(),
                "assistant api returned non-success status"
            );
        }
        Ok(body)
    }
}
