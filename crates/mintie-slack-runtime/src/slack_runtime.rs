//! Slack bridge runtime that receives Socket Mode events and answers them
//! through progressive replies.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use mintie_assistant::{AssistantConfig, AssistantHttpClient};
use mintie_core::TtlCache;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

mod render_helpers;
mod reply_controller;
mod slack_api_client;
mod transport;
mod workspace_config;

use render_helpers::{compose_question, render_thread_context, strip_bot_mention};
use reply_controller::REPLY_FAILURE_APOLOGY;

pub use reply_controller::{ProgressiveReplyController, ReplyPhase};
pub use slack_api_client::{SlackApiClient, ThreadMessage};
pub use transport::{ChatTransport, PostedMessage};
pub use workspace_config::{StaticWorkspaceLookup, WorkspaceConfig, WorkspaceConfigLookup};

const SETUP_REQUIRED_GREETING: &str = "Hi! I'm Mintie, your AI documentation assistant. \
    To get started, please complete your setup by adding your documentation API key.";

#[derive(Clone)]
/// Runtime configuration for the Slack bridge transport loop.
pub struct SlackBridgeRuntimeConfig {
    pub api_base: String,
    pub app_token: String,
    pub bot_token: String,
    /// Resolved through `auth.test` when not provided.
    pub bot_user_id: Option<String>,
    pub team_id: Option<String>,
    pub request_timeout_ms: u64,
    pub assistant_request_timeout_ms: u64,
    pub status_interval: Duration,
    pub reconnect_delay: Duration,
    pub processed_event_cap: usize,
    pub thread_history_limit: usize,
    pub config_cache_ttl_ms: u64,
    pub config_lookup: Arc<dyn WorkspaceConfigLookup>,
}

/// Runs the Slack bridge transport loop until shutdown is requested.
pub async fn run_slack_bridge(config: SlackBridgeRuntimeConfig) -> Result<()> {
    let mut runtime = SlackBridgeRuntime::new(config).await?;
    runtime.run().await
}

struct SlackBridgeRuntime {
    config: SlackBridgeRuntimeConfig,
    slack_client: SlackApiClient,
    bot_user_id: String,
    team_id: String,
    processed_events: ProcessedEventSet,
    config_cache: TtlCache<WorkspaceConfig>,
}

impl SlackBridgeRuntime {
    async fn new(config: SlackBridgeRuntimeConfig) -> Result<Self> {
        let slack_client = SlackApiClient::new(
            config.api_base.clone(),
            config.app_token.clone(),
            config.bot_token.clone(),
            config.request_timeout_ms,
        )?;

        let provided_identity = match (config.bot_user_id.clone(), config.team_id.clone()) {
            (Some(user_id), Some(team_id))
                if !user_id.trim().is_empty() && !team_id.trim().is_empty() =>
            {
                Some((user_id.trim().to_string(), team_id.trim().to_string()))
            }
            _ => None,
        };
        let (bot_user_id, team_id) = match provided_identity {
            Some(identity) => identity,
            None => {
                let identity = slack_client.resolve_identity().await?;
                (identity.user_id, identity.team_id)
            }
        };

        let processed_events = ProcessedEventSet::new(config.processed_event_cap);
        Ok(Self {
            config,
            slack_client,
            bot_user_id,
            team_id,
            processed_events,
            config_cache: TtlCache::new(),
        })
    }

    async fn run(&mut self) -> Result<()> {
        loop {
            let socket_url = match self.slack_client.open_socket_connection().await {
                Ok(url) => url,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to open slack socket connection");
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            tracing::info!("slack bridge shutdown requested");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                    }
                    continue;
                }
            };

            tracing::info!("slack bridge socket connected");
            if let Err(error) = self.run_socket_session(&socket_url).await {
                tracing::warn!(error = %error, "slack socket session ended with error");
            }

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("slack bridge shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    async fn run_socket_session(&mut self, socket_url: &str) -> Result<()> {
        let (stream, _response) = connect_async(socket_url)
            .await
            .with_context(|| "failed to connect slack socket mode websocket")?;
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    return Ok(());
                }
                maybe_message = source.next() => {
                    let Some(message_result) = maybe_message else {
                        return Ok(());
                    };
                    let message = message_result.context("failed reading slack websocket message")?;
                    match parse_socket_envelope(message) {
                        Ok(Some(envelope)) => {
                            self.ack_envelope(&mut sink, &envelope.envelope_id).await?;
                            if let Err(error) = self.handle_envelope(envelope).await {
                                tracing::warn!(error = %error, "failed to handle slack envelope");
                            }
                        }
                        Ok(None) => {}
                        Err(error) => {
                            tracing::debug!(error = %error, "skipping undecodable slack envelope");
                        }
                    }
                }
            }
        }
    }

    async fn ack_envelope<S>(&self, sink: &mut S, envelope_id: &str) -> Result<()>
    where
        S: futures_util::Sink<WsMessage> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let ack = json!({ "envelope_id": envelope_id }).to_string();
        sink.send(WsMessage::Text(ack.into()))
            .await
            .context("failed to send slack socket ack")
    }

    async fn handle_envelope(&mut self, envelope: SlackSocketEnvelope) -> Result<()> {
        let Some(event) = normalize_socket_envelope(&envelope, &self.bot_user_id)? else {
            return Ok(());
        };

        if !self.processed_events.mark_processed(&event.key) {
            tracing::debug!(key = %event.key, "skipping duplicate slack event");
            return Ok(());
        }

        self.dispatch_reply(event).await
    }

    async fn dispatch_reply(&self, event: SlackBridgeEvent) -> Result<()> {
        let workspace = match self.workspace_config().await {
            Ok(Some(workspace)) => workspace,
            Ok(None) => {
                self.slack_client
                    .post_message(
                        &event.channel_id,
                        SETUP_REQUIRED_GREETING,
                        event.reply_thread_ts(),
                    )
                    .await?;
                return Ok(());
            }
            Err(error) => {
                tracing::warn!(error = %error, "workspace config lookup failed");
                self.slack_client
                    .post_message(
                        &event.channel_id,
                        REPLY_FAILURE_APOLOGY,
                        event.reply_thread_ts(),
                    )
                    .await?;
                return Ok(());
            }
        };

        tracing::info!(
            channel = %event.channel_id,
            user = %event.user_id,
            key = %event.key,
            "answering slack event"
        );
        let question = self.compose_event_question(&event).await;

        let backend = match AssistantHttpClient::new(AssistantConfig {
            api_base: workspace.assistant_api_base.clone(),
            api_key: workspace.assistant_api_key.clone(),
            request_timeout_ms: self.config.assistant_request_timeout_ms,
        }) {
            Ok(backend) => backend,
            Err(error) => {
                tracing::warn!(error = %error, "failed to build assistant client");
                self.slack_client
                    .post_message(
                        &event.channel_id,
                        REPLY_FAILURE_APOLOGY,
                        event.reply_thread_ts(),
                    )
                    .await?;
                return Ok(());
            }
        };

        let controller = ProgressiveReplyController::new(
            Arc::new(self.slack_client.clone()),
            Arc::new(backend),
            workspace.docs_base_url.clone(),
            self.config.status_interval,
        );
        let channel = event.channel_id.clone();
        let thread_ts = event.reply_thread_ts().map(ToOwned::to_owned);
        tokio::spawn(async move {
            controller
                .reply(&question, &channel, thread_ts.as_deref())
                .await;
        });
        Ok(())
    }

    /// Builds the outbound question: mention stripped, with prior thread
    /// context prepended for threaded messages. History fetch failures
    /// degrade to a context-free question.
    async fn compose_event_question(&self, event: &SlackBridgeEvent) -> String {
        let message_text = strip_bot_mention(&event.text, &self.bot_user_id);

        let context = match &event.thread_ts {
            Some(thread_ts) => {
                match self
                    .slack_client
                    .fetch_thread_replies(
                        &event.channel_id,
                        thread_ts,
                        self.config.thread_history_limit,
                    )
                    .await
                {
                    Ok(messages) => render_thread_context(&messages),
                    Err(error) => {
                        tracing::debug!(error = %error, "thread history fetch failed");
                        None
                    }
                }
            }
            None => None,
        };

        compose_question(context.as_deref(), &message_text)
    }

    async fn workspace_config(&self) -> Result<Option<WorkspaceConfig>> {
        if let Some(cached) = self.config_cache.get(&self.team_id) {
            return Ok(Some(cached));
        }
        let looked_up = self
            .config
            .config_lookup
            .workspace_config(&self.team_id)
            .await?;
        if let Some(workspace) = &looked_up {
            self.config_cache.put(
                &self.team_id,
                workspace.clone(),
                self.config.config_cache_ttl_ms,
            );
        }
        Ok(looked_up)
    }
}

/// Recently processed event keys, capped so memory stays bounded.
struct ProcessedEventSet {
    keys: VecDeque<String>,
    index: HashSet<String>,
    cap: usize,
}

impl ProcessedEventSet {
    fn new(cap: usize) -> Self {
        Self {
            keys: VecDeque::new(),
            index: HashSet::new(),
            cap: cap.max(1),
        }
    }

    /// Records `key`; returns false when it was already present.
    fn mark_processed(&mut self, key: &str) -> bool {
        if self.index.contains(key) {
            return false;
        }
        self.keys.push_back(key.to_string());
        self.index.insert(key.to_string());
        while self.keys.len() > self.cap {
            if let Some(removed) = self.keys.pop_front() {
                self.index.remove(&removed);
            }
        }
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SlackSocketEnvelope {
    envelope_id: String,
    #[serde(rename = "type")]
    envelope_type: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct SlackEventCallbackEnvelope {
    #[serde(rename = "type")]
    callback_type: String,
    event_id: String,
    event: SlackEventPayload,
}

#[derive(Debug, Deserialize)]
struct SlackEventPayload {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    channel_type: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlackBridgeEventKind {
    AppMention,
    DirectMessage,
}

#[derive(Debug, Clone)]
struct SlackBridgeEvent {
    key: String,
    kind: SlackBridgeEventKind,
    channel_id: String,
    user_id: String,
    text: String,
    ts: String,
    thread_ts: Option<String>,
}

impl SlackBridgeEvent {
    /// Mentions reply in a thread under the triggering message; DMs thread
    /// only when the question itself was threaded.
    fn reply_thread_ts(&self) -> Option<&str> {
        match self.kind {
            SlackBridgeEventKind::AppMention => {
                self.thread_ts.as_deref().or(Some(self.ts.as_str()))
            }
            SlackBridgeEventKind::DirectMessage => self.thread_ts.as_deref(),
        }
    }
}

fn parse_socket_envelope(message: WsMessage) -> Result<Option<SlackSocketEnvelope>> {
    match message {
        WsMessage::Text(text) => {
            let envelope = serde_json::from_str::<SlackSocketEnvelope>(&text)
                .context("failed to parse slack socket envelope")?;
            Ok(Some(envelope))
        }
        WsMessage::Binary(bytes) => {
            let text =
                String::from_utf8(bytes.to_vec()).context("invalid utf-8 slack socket payload")?;
            let envelope = serde_json::from_str::<SlackSocketEnvelope>(&text)
                .context("failed to parse slack socket envelope")?;
            Ok(Some(envelope))
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) => Ok(None),
        WsMessage::Close(_) => Ok(None),
        WsMessage::Frame(_) => Ok(None),
    }
}

fn normalize_socket_envelope(
    envelope: &SlackSocketEnvelope,
    bot_user_id: &str,
) -> Result<Option<SlackBridgeEvent>> {
    if envelope.envelope_type != "events_api" {
        return Ok(None);
    }

    let callback = serde_json::from_value::<SlackEventCallbackEnvelope>(envelope.payload.clone())
        .context("failed to decode slack event callback payload")?;
    if callback.callback_type != "event_callback" {
        return Ok(None);
    }

    let event = callback.event;
    if event.subtype.as_deref() == Some("bot_message") || event.bot_id.is_some() {
        return Ok(None);
    }
    let user_id = match event.user {
        Some(user) if !user.trim().is_empty() => user,
        _ => return Ok(None),
    };
    if user_id == bot_user_id {
        return Ok(None);
    }

    let channel_id = match event.channel {
        Some(channel) if !channel.trim().is_empty() => channel,
        _ => return Ok(None),
    };
    let message_ts = match event.ts {
        Some(ts) if !ts.trim().is_empty() => ts,
        _ => return Ok(None),
    };

    let kind = match event.event_type.as_str() {
        "app_mention" => SlackBridgeEventKind::AppMention,
        "message" if event.channel_type.as_deref() == Some("im") || channel_id.starts_with('D') => {
            SlackBridgeEventKind::DirectMessage
        }
        _ => return Ok(None),
    };

    let key = format!("{}:{}:{}", callback.event_id, channel_id, message_ts);
    Ok(Some(SlackBridgeEvent {
        key,
        kind,
        channel_id,
        user_id,
        text: event.text.unwrap_or_default(),
        ts: message_ts,
        thread_ts: event.thread_ts,
    }))
}

#[cfg(test)]
mod tests;
