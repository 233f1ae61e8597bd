use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::AssistantRequest;

#[derive(Debug, Error)]
/// Failures raised by the assistant backend client.
pub enum AssistantError {
    #[error("missing assistant API key")]
    MissingApiKey,
    #[error("invalid assistant configuration: {0}")]
    InvalidConfig(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// A citation link extracted from an assistant response.
///
/// `link` may be an absolute URL, a `/`-rooted documentation path, or a
/// Slack-style hyperlink token `</path|label>`.
pub struct DocsLink {
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Normalized assistant answer: cleaned message text plus citation sources.
pub struct ParsedAnswer {
    pub content: String,
    pub sources: Vec<DocsLink>,
}

#[async_trait]
/// Trait contract for sending a question to the assistant API.
///
/// Implementations return the raw response body even for non-success HTTP
/// statuses; only transport-level failures (connect, timeout) surface as
/// errors.
pub trait AssistantBackend: Send + Sync {
    async fn send(&self, request: &AssistantRequest) -> Result<String, AssistantError>;
}
