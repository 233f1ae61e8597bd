//! Progressive reply lifecycle: placeholder post, status cycling, final edit.
//!
//! One controller call answers one inbound message. The placeholder message
//! posted first is the anchor for every subsequent write: status ticks edit
//! it in place, and finalization replaces it with the parsed answer, spilling
//! into a single threaded follow-up when the content exceeds the Slack size
//! budget. Cancelling the status timer is always the first action of
//! finalization, and a stopped flag makes any late tick a no-op.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Result;
use mintie_assistant::{
    generate_fingerprint, parse_assistant_response, resolve_docs_link, AssistantBackend,
    AssistantError, AssistantRequest, DocsLink, ParsedAnswer, DEFAULT_DOCS_BASE_URL,
};
use mintie_core::current_unix_timestamp_ms;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::render_helpers::truncate_for_error;
use super::transport::ChatTransport;

/// Posted when a reply attempt fails; never carries internal error detail.
pub(super) const REPLY_FAILURE_APOLOGY: &str =
    "Sorry, I encountered an error while processing your request.";

/// Fixed status rotation; the placeholder starts at index 0 and each tick
/// advances one step, wrapping.
const THINKING_ROTATION: [&str; 3] = ["Thinking.", "Thinking..", "Thinking..."];

/// Message-size safety margin, below the hard platform limit.
const SLACK_CONTENT_BUDGET: usize = 3000;

/// How far from the midpoint the split search looks for a blank line.
const SPLIT_SCAN_WINDOW: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of one reply session.
pub enum ReplyPhase {
    Idle,
    PlaceholderPosted,
    StatusCycling,
    Finalizing,
    Done,
    Error,
}

struct ReplySession {
    channel: String,
    anchor_ts: String,
    stopped: Arc<AtomicBool>,
    ticker: Option<JoinHandle<()>>,
    phase: ReplyPhase,
}

impl ReplySession {
    /// Stops the status cycle. Safe to call more than once; the flag keeps a
    /// tick that already fired from editing the anchor after this point.
    fn stop_status_cycle(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl Drop for ReplySession {
    fn drop(&mut self) {
        self.stop_status_cycle();
    }
}

/// Drives one in-place-updating reply per inbound message.
pub struct ProgressiveReplyController {
    transport: Arc<dyn ChatTransport>,
    backend: Arc<dyn AssistantBackend>,
    docs_base_url: Option<String>,
    status_interval: Duration,
}

impl ProgressiveReplyController {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        backend: Arc<dyn AssistantBackend>,
        docs_base_url: Option<String>,
        status_interval: Duration,
    ) -> Self {
        Self {
            transport,
            backend,
            docs_base_url,
            status_interval,
        }
    }

    /// Answers `user_message` in `channel`, threaded under `thread_ts` when
    /// given. Fire-and-forget: every failure is converted into a degraded
    /// reply and the terminal phase is returned for observability only.
    pub async fn reply(
        &self,
        user_message: &str,
        channel: &str,
        thread_ts: Option<&str>,
    ) -> ReplyPhase {
        let mut session = match self.open_session(channel, thread_ts).await {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(
                    channel,
                    error = %truncate_for_error(&error.to_string(), 600),
                    "failed to post reply placeholder"
                );
                return ReplyPhase::Error;
            }
        };

        match self.request_answer(user_message, channel, thread_ts).await {
            Ok(raw) => self.finalize(&mut session, &raw).await,
            Err(error) => self.fail(&mut session, &error).await,
        }
    }

    async fn open_session(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
    ) -> Result<ReplySession> {
        let posted = self
            .transport
            .post_message(channel, THINKING_ROTATION[0], thread_ts)
            .await?;

        let mut session = ReplySession {
            channel: posted.channel,
            anchor_ts: posted.ts,
            stopped: Arc::new(AtomicBool::new(false)),
            ticker: None,
            phase: ReplyPhase::PlaceholderPosted,
        };
        session.ticker = Some(self.spawn_status_cycle(
            session.channel.clone(),
            session.anchor_ts.clone(),
            session.stopped.clone(),
        ));
        session.phase = ReplyPhase::StatusCycling;
        Ok(session)
    }

    fn spawn_status_cycle(
        &self,
        channel: String,
        anchor_ts: String,
        stopped: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let period = self.status_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; the placeholder already
            // shows rotation index 0.
            interval.tick().await;
            let mut index = 0_usize;
            loop {
                interval.tick().await;
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                index = (index + 1) % THINKING_ROTATION.len();
                if let Err(error) = transport
                    .update_message(&channel, &anchor_ts, THINKING_ROTATION[index], None)
                    .await
                {
                    tracing::debug!(channel = %channel, error = %error, "status tick update failed");
                }
            }
        })
    }

    async fn request_answer(
        &self,
        user_message: &str,
        channel: &str,
        thread_ts: Option<&str>,
    ) -> Result<String, AssistantError> {
        let now_unix_ms = current_unix_timestamp_ms();
        let fingerprint = generate_fingerprint(channel, thread_ts, now_unix_ms);
        let request = AssistantRequest::user_question(user_message, &fingerprint, now_unix_ms);
        self.backend.send(&request).await
    }

    async fn finalize(&self, session: &mut ReplySession, raw: &str) -> ReplyPhase {
        session.phase = ReplyPhase::Finalizing;
        session.stop_status_cycle();

        let answer = parse_assistant_response(raw, self.docs_base_url.as_deref());
        match self.render_answer(session, &answer).await {
            Ok(()) => {
                session.phase = ReplyPhase::Done;
            }
            Err(error) => {
                // Render failures are terminal: no retries, no further
                // writes for this session.
                tracing::warn!(
                    channel = %session.channel,
                    error = %truncate_for_error(&error.to_string(), 600),
                    "failed to deliver final reply"
                );
                session.phase = ReplyPhase::Error;
            }
        }
        session.phase
    }

    async fn render_answer(&self, session: &ReplySession, answer: &ParsedAnswer) -> Result<()> {
        let base_url = self
            .docs_base_url
            .as_deref()
            .unwrap_or(DEFAULT_DOCS_BASE_URL);

        if answer.content.chars().count() > SLACK_CONTENT_BUDGET {
            let split_at = find_safe_split_point(&answer.content);
            let first = answer.content[..split_at].trim();
            let second = answer.content[split_at..].trim();

            self.transport
                .update_message(
                    &session.channel,
                    &session.anchor_ts,
                    first,
                    Some(content_blocks(first, &[], base_url)),
                )
                .await?;

            let mut overflow = second.to_string();
            if !answer.sources.is_empty() {
                overflow.push_str("\n\n");
                overflow.push_str(&format_sources_line(&answer.sources, base_url));
            }
            self.transport
                .post_message(&session.channel, &overflow, Some(&session.anchor_ts))
                .await?;
        } else {
            let mut text = answer.content.clone();
            if !answer.sources.is_empty() {
                text.push_str("\n\n");
                text.push_str(&format_sources_line(&answer.sources, base_url));
            }
            self.transport
                .update_message(
                    &session.channel,
                    &session.anchor_ts,
                    &text,
                    Some(content_blocks(&answer.content, &answer.sources, base_url)),
                )
                .await?;
        }
        Ok(())
    }

    async fn fail(&self, session: &mut ReplySession, error: &AssistantError) -> ReplyPhase {
        session.stop_status_cycle();
        tracing::warn!(
            channel = %session.channel,
            error = %truncate_for_error(&error.to_string(), 600),
            "assistant request failed"
        );

        // The anchor must never stay stuck on a status phrase.
        if let Err(update_error) = self
            .transport
            .update_message(&session.channel, &session.anchor_ts, REPLY_FAILURE_APOLOGY, None)
            .await
        {
            tracing::warn!(
                channel = %session.channel,
                error = %truncate_for_error(&update_error.to_string(), 600),
                "failed to deliver failure notice"
            );
        }
        session.phase = ReplyPhase::Error;
        session.phase
    }
}

/// Message blocks for one reply segment: a markdown content block plus, when
/// sources exist, a divider and a sources section.
fn content_blocks(content: &str, sources: &[DocsLink], docs_base_url: &str) -> Vec<Value> {
    let mut blocks = vec![json!({
        "type": "markdown",
        "text": content,
    })];
    if !sources.is_empty() {
        blocks.push(json!({"type": "divider"}));
        blocks.push(json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format_sources_line(sources, docs_base_url),
            },
        }));
    }
    blocks
}

/// Renders the citations line: sources numbered in array order, not
/// deduplicated, each resolved to an absolute URL.
pub(super) fn format_sources_line(sources: &[DocsLink], docs_base_url: &str) -> String {
    let links = sources
        .iter()
        .enumerate()
        .map(|(index, source)| {
            format!(
                "<{}|{}>",
                resolve_docs_link(&source.link, docs_base_url),
                index + 1
            )
        })
        .collect::<Vec<_>>()
        .join(" \u{2022} ");
    format!("*Sources:* {links}")
}

/// Finds a split position for over-budget content: the blank-line boundary
/// nearest the midpoint within the scan window (forward first, then
/// backward), else the nearest space before the midpoint, else the midpoint
/// itself.
pub(super) fn find_safe_split_point(content: &str) -> usize {
    let bytes = content.as_bytes();
    let mid = floor_char_boundary(content, bytes.len() / 2);

    let forward_end = (mid + SPLIT_SCAN_WINDOW).min(bytes.len().saturating_sub(1));
    for i in mid..forward_end {
        if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
            return i + 2;
        }
    }
    for i in (mid.saturating_sub(SPLIT_SCAN_WINDOW)..mid).rev() {
        if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
            return i + 2;
        }
    }

    match content[..mid].rfind(' ') {
        Some(position) => position + 1,
        None => mid,
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
