use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `MessageRole` values.
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Typed message fragment carried in the `parts` array of a request message.
pub enum MessagePart {
    Text { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One conversational message in the assistant request body.
pub struct AssistantMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// POST body for the assistant `/message` endpoint.
pub struct AssistantRequest {
    pub fp: String,
    pub messages: Vec<AssistantMessage>,
    #[serde(rename = "slackAgent")]
    pub slack_agent: bool,
}

impl AssistantRequest {
    /// Builds a single-question request carrying `user_message` as both the
    /// flat `content` and the sole text part.
    pub fn user_question(user_message: &str, fingerprint: &str, now_unix_ms: u64) -> Self {
        Self {
            fp: fingerprint.to_string(),
            messages: vec![AssistantMessage {
                id: format!("msg-{now_unix_ms}"),
                role: MessageRole::User,
                content: user_message.to_string(),
                parts: vec![MessagePart::Text {
                    text: user_message.to_string(),
                }],
            }],
            slack_agent: true,
        }
    }
}

/// Per-request correlation string sent upstream for tracing/deduplication.
/// Never reused across calls; the timestamp component guarantees that.
pub fn generate_fingerprint(channel: &str, thread_ts: Option<&str>, now_unix_ms: u64) -> String {
    format!("{}-{}-{}", channel, thread_ts.unwrap_or("main"), now_unix_ms)
}

#[cfg(test)]
mod tests {
    use super::{generate_fingerprint, AssistantRequest, MessagePart, MessageRole};

    #[test]
    fn unit_generate_fingerprint_combines_channel_thread_and_timestamp() {
        assert_eq!(
            generate_fingerprint("C1", Some("10.5"), 1_700),
            "C1-10.5-1700"
        );
        assert_eq!(generate_fingerprint("D9", None, 42), "D9-main-42");
    }

    #[test]
    fn unit_user_question_serializes_to_expected_wire_shape() {
        let request = AssistantRequest::user_question("How do I deploy?", "C1-main-7", 7);
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, MessageRole::User);
        assert_eq!(request.messages[0].id, "msg-7");
        assert_eq!(
            request.messages[0].parts,
            vec![MessagePart::Text {
                text: "How do I deploy?".to_string()
            }]
        );

        let encoded = serde_json::to_value(&request).expect("encode request");
        assert_eq!(encoded["fp"], "C1-main-7");
        assert_eq!(encoded["slackAgent"], true);
        assert_eq!(encoded["messages"][0]["parts"][0]["type"], "text");
        assert_eq!(
            encoded["messages"][0]["parts"][0]["text"],
            "How do I deploy?"
        );
    }
}
