use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Identity of a posted chat message, the anchor for in-place edits.
pub struct PostedMessage {
    pub channel: String,
    pub ts: String,
}

#[async_trait]
/// Capability contract for the chat surface the reply controller writes to.
///
/// Implementations must support editing a previously posted message by
/// identity and posting new messages threaded under an existing one. The
/// client is shared across concurrent reply sessions, so calls must be
/// stateless beyond their arguments.
pub trait ChatTransport: Send + Sync {
    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<PostedMessage>;

    async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        text: &str,
        blocks: Option<Vec<Value>>,
    ) -> Result<()>;
}
