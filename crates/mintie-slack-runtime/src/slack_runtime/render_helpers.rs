//! Prompt and context rendering helpers for the bridge flows.

use super::slack_api_client::ThreadMessage;

/// Removes the bot's own mention token from an inbound message.
pub(super) fn strip_bot_mention(text: &str, bot_user_id: &str) -> String {
    let mention = format!("<@{bot_user_id}>");
    text.replace(&mention, "").trim().to_string()
}

/// Renders prior thread messages as conversation context, labelling bot
/// messages `Assistant` and everything else `User`. The final message is the
/// one being answered and is skipped. Returns `None` when there is no prior
/// conversation.
pub(super) fn render_thread_context(messages: &[ThreadMessage]) -> Option<String> {
    if messages.len() < 2 {
        return None;
    }
    let lines = messages[..messages.len() - 1]
        .iter()
        .map(|message| {
            let sender = if message.bot_id.is_some()
                || message.subtype.as_deref() == Some("bot_message")
            {
                "Assistant"
            } else {
                "User"
            };
            format!("{sender}: {}", message.text.as_deref().unwrap_or(""))
        })
        .collect::<Vec<_>>()
        .join("\n");
    Some(format!("Previous conversation context:\n{lines}"))
}

/// Joins optional thread context with the triggering message.
pub(super) fn compose_question(context: Option<&str>, message_text: &str) -> String {
    match context {
        Some(context) => format!("{context}\n\nCurrent message: {message_text}"),
        None => message_text.to_string(),
    }
}

pub(super) fn truncate_for_error(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut truncated = value.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}
