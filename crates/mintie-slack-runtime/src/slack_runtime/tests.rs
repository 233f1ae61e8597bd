//! Tests for the Slack bridge runtime and progressive reply behavior.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use httpmock::prelude::*;
use mintie_assistant::{AssistantBackend, AssistantError, AssistantRequest, DocsLink};
use serde_json::{json, Value};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::render_helpers::{compose_question, render_thread_context, strip_bot_mention};
use super::reply_controller::{find_safe_split_point, format_sources_line, REPLY_FAILURE_APOLOGY};
use super::slack_api_client::ThreadMessage;
use super::transport::{ChatTransport, PostedMessage};
use super::{
    normalize_socket_envelope, parse_socket_envelope, ProcessedEventSet,
    ProgressiveReplyController, ReplyPhase, SlackApiClient, SlackBridgeEventKind,
    SlackBridgeRuntime, SlackBridgeRuntimeConfig, SlackSocketEnvelope, StaticWorkspaceLookup,
    WorkspaceConfig, WorkspaceConfigLookup,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum TransportCall {
    Post {
        channel: String,
        text: String,
        thread_ts: Option<String>,
    },
    Update {
        channel: String,
        ts: String,
        text: String,
        has_blocks: bool,
    },
}

#[derive(Default)]
struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
    posted: AtomicUsize,
    fail_updates: AtomicBool,
}

impl RecordingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing_updates() -> Arc<Self> {
        let transport = Self::default();
        transport.fail_updates.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn update_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Update { text, .. } => Some(text),
                TransportCall::Post { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<PostedMessage> {
        let sequence = self.posted.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls
            .lock()
            .expect("calls lock")
            .push(TransportCall::Post {
                channel: channel.to_string(),
                text: text.to_string(),
                thread_ts: thread_ts.map(ToOwned::to_owned),
            });
        Ok(PostedMessage {
            channel: channel.to_string(),
            ts: format!("100.{sequence}"),
        })
    }

    async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        text: &str,
        blocks: Option<Vec<Value>>,
    ) -> Result<()> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(TransportCall::Update {
                channel: channel.to_string(),
                ts: ts.to_string(),
                text: text.to_string(),
                has_blocks: blocks.is_some(),
            });
        if self.fail_updates.load(Ordering::SeqCst) {
            bail!("simulated update failure");
        }
        Ok(())
    }
}

struct StaticBackend {
    raw: String,
}

#[async_trait]
impl AssistantBackend for StaticBackend {
    async fn send(&self, _request: &AssistantRequest) -> Result<String, AssistantError> {
        Ok(self.raw.clone())
    }
}

struct SlowBackend {
    raw: String,
    delay: Duration,
}

#[async_trait]
impl AssistantBackend for SlowBackend {
    async fn send(&self, _request: &AssistantRequest) -> Result<String, AssistantError> {
        sleep(self.delay).await;
        Ok(self.raw.clone())
    }
}

struct FailingBackend;

#[async_trait]
impl AssistantBackend for FailingBackend {
    async fn send(&self, _request: &AssistantRequest) -> Result<String, AssistantError> {
        Err(AssistantError::InvalidConfig(
            "simulated backend failure".to_string(),
        ))
    }
}

fn controller(
    transport: Arc<RecordingTransport>,
    backend: Arc<dyn AssistantBackend>,
    status_interval_ms: u64,
) -> ProgressiveReplyController {
    ProgressiveReplyController::new(
        transport,
        backend,
        Some("https://x.com/docs".to_string()),
        Duration::from_millis(status_interval_ms),
    )
}

#[tokio::test]
async fn functional_reply_short_answer_edits_anchor_exactly_once() {
    let transport = RecordingTransport::new();
    let backend = Arc::new(StaticBackend {
        raw: r#"{"message":"Short answer."}"#.to_string(),
    });

    let phase = controller(transport.clone(), backend, 60_000)
        .reply("question", "C1", None)
        .await;
    assert_eq!(phase, ReplyPhase::Done);

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0],
        TransportCall::Post {
            channel: "C1".to_string(),
            text: "Thinking.".to_string(),
            thread_ts: None,
        }
    );
    assert_eq!(
        calls[1],
        TransportCall::Update {
            channel: "C1".to_string(),
            ts: "100.1".to_string(),
            text: "Short answer.".to_string(),
            has_blocks: true,
        }
    );
}

#[tokio::test]
async fn functional_reply_threads_placeholder_under_given_thread() {
    let transport = RecordingTransport::new();
    let backend = Arc::new(StaticBackend {
        raw: r#"{"message":"ok"}"#.to_string(),
    });

    controller(transport.clone(), backend, 60_000)
        .reply("question", "C1", Some("42.7"))
        .await;

    match &transport.calls()[0] {
        TransportCall::Post { thread_ts, .. } => {
            assert_eq!(thread_ts.as_deref(), Some("42.7"));
        }
        other => panic!("expected placeholder post, got {other:?}"),
    }
}

#[tokio::test]
async fn functional_reply_appends_citations_block_in_order() {
    let transport = RecordingTransport::new();
    let raw = json!({
        "message": "See the docs.",
        "sources": [
            {"link": "/guides/start"},
            {"link": "https://ext.example/page"},
        ],
    })
    .to_string();
    let backend = Arc::new(StaticBackend { raw });

    let phase = controller(transport.clone(), backend, 60_000)
        .reply("question", "C1", None)
        .await;
    assert_eq!(phase, ReplyPhase::Done);

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    match &calls[1] {
        TransportCall::Update {
            text, has_blocks, ..
        } => {
            assert!(*has_blocks);
            assert_eq!(
                text,
                "See the docs.\n\n*Sources:* <https://x.com/docs/guides/start|1> \u{2022} <https://ext.example/page|2>"
            );
        }
        other => panic!("expected final update, got {other:?}"),
    }
}

#[tokio::test]
async fn functional_reply_long_answer_splits_into_edit_plus_threaded_post() {
    let first_half = "alpha ".repeat(320).trim_end().to_string();
    let second_half = "beta ".repeat(320).trim_end().to_string();
    let content = format!("{first_half}\n\n{second_half}");
    assert!(content.chars().count() > 3000);

    let transport = RecordingTransport::new();
    let raw = json!({"message": content, "sources": [{"link": "/ref"}]}).to_string();
    let backend = Arc::new(StaticBackend { raw });

    let phase = controller(transport.clone(), backend, 60_000)
        .reply("question", "C1", None)
        .await;
    assert_eq!(phase, ReplyPhase::Done);

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);

    let first_part = match &calls[1] {
        TransportCall::Update {
            ts,
            text,
            has_blocks,
            ..
        } => {
            assert_eq!(ts, "100.1");
            assert!(*has_blocks);
            text.clone()
        }
        other => panic!("expected anchor edit, got {other:?}"),
    };
    let overflow = match &calls[2] {
        TransportCall::Post {
            text, thread_ts, ..
        } => {
            assert_eq!(thread_ts.as_deref(), Some("100.1"));
            text.clone()
        }
        other => panic!("expected threaded overflow post, got {other:?}"),
    };

    assert_eq!(first_part, first_half);
    assert_eq!(
        overflow,
        format!("{second_half}\n\n*Sources:* <https://x.com/docs/ref|1>")
    );
    // No character loss or duplication beyond the consumed blank line.
    assert_eq!(format!("{first_part}\n\n{second_half}"), content);
}

#[tokio::test]
async fn functional_status_rotation_is_deterministic() {
    let transport = RecordingTransport::new();
    let backend = Arc::new(SlowBackend {
        raw: r#"{"message":"done"}"#.to_string(),
        delay: Duration::from_millis(170),
    });

    let phase = controller(transport.clone(), backend, 40)
        .reply("question", "C1", None)
        .await;
    assert_eq!(phase, ReplyPhase::Done);

    let updates = transport.update_texts();
    let (ticks, last) = updates.split_at(updates.len() - 1);
    assert_eq!(last, ["done".to_string()]);
    assert!(!ticks.is_empty(), "expected at least one status tick");

    let rotation = ["Thinking.", "Thinking..", "Thinking..."];
    for (index, tick) in ticks.iter().enumerate() {
        assert_eq!(tick, rotation[(index + 1) % rotation.len()]);
    }
}

#[tokio::test]
async fn regression_backend_failure_stops_timer_and_writes_single_apology() {
    let transport = RecordingTransport::new();
    let phase = controller(transport.clone(), Arc::new(FailingBackend), 25)
        .reply("question", "C1", None)
        .await;
    assert_eq!(phase, ReplyPhase::Error);

    let calls = transport.calls();
    match calls.last() {
        Some(TransportCall::Update {
            text, has_blocks, ..
        }) => {
            assert_eq!(text, REPLY_FAILURE_APOLOGY);
            assert!(!has_blocks);
        }
        other => panic!("expected apology update, got {other:?}"),
    }

    // The status timer must be dead: no further edits after the failure.
    let settled = calls.len();
    sleep(Duration::from_millis(120)).await;
    assert_eq!(transport.calls().len(), settled);
}

#[tokio::test]
async fn regression_render_failure_abandons_overflow_post() {
    let first_half = "alpha ".repeat(320).trim_end().to_string();
    let second_half = "beta ".repeat(320).trim_end().to_string();
    let raw = json!({"message": format!("{first_half}\n\n{second_half}")}).to_string();

    let transport = RecordingTransport::failing_updates();
    let phase = controller(transport.clone(), Arc::new(StaticBackend { raw }), 60_000)
        .reply("question", "C1", None)
        .await;
    assert_eq!(phase, ReplyPhase::Error);

    // One placeholder post, one failed anchor edit, nothing else: the session
    // abandons further writes instead of retrying.
    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(calls[1], TransportCall::Update { .. }));
}

#[tokio::test]
async fn regression_placeholder_post_failure_yields_error_phase() {
    struct RejectingTransport;

    #[async_trait]
    impl ChatTransport for RejectingTransport {
        async fn post_message(
            &self,
            _channel: &str,
            _text: &str,
            _thread_ts: Option<&str>,
        ) -> Result<PostedMessage> {
            bail!("not_in_channel")
        }

        async fn update_message(
            &self,
            _channel: &str,
            _ts: &str,
            _text: &str,
            _blocks: Option<Vec<Value>>,
        ) -> Result<()> {
            Ok(())
        }
    }

    let controller = ProgressiveReplyController::new(
        Arc::new(RejectingTransport),
        Arc::new(StaticBackend {
            raw: "unused".to_string(),
        }),
        None,
        Duration::from_millis(60_000),
    );
    assert_eq!(controller.reply("q", "C1", None).await, ReplyPhase::Error);
}

#[test]
fn unit_find_safe_split_point_prefers_blank_line_before_midpoint() {
    let content = format!("{}\n\n{}", "a".repeat(100), "b".repeat(100));
    assert_eq!(find_safe_split_point(&content), 102);
}

#[test]
fn unit_find_safe_split_point_finds_blank_line_after_midpoint() {
    let content = format!("{}\n\n{}", "a".repeat(260), "b".repeat(200));
    // Midpoint 231 sits before the boundary at 260; the forward scan wins.
    assert_eq!(find_safe_split_point(&content), 262);
}

#[test]
fn regression_find_safe_split_point_falls_back_to_whitespace() {
    let content = "word ".repeat(100);
    assert_eq!(find_safe_split_point(&content), 250);
}

#[test]
fn regression_find_safe_split_point_handles_unbroken_content() {
    let content = "x".repeat(100);
    assert_eq!(find_safe_split_point(&content), 50);
}

#[test]
fn unit_format_sources_line_numbers_sources_in_array_order() {
    let sources = vec![
        DocsLink {
            link: "/a".to_string(),
            title: None,
        },
        DocsLink {
            link: "https://ext.example/b".to_string(),
            title: Some("B".to_string()),
        },
        DocsLink {
            link: "</c|C>".to_string(),
            title: None,
        },
    ];
    assert_eq!(
        format_sources_line(&sources, "https://x.com/docs"),
        "*Sources:* <https://x.com/docs/a|1> \u{2022} <https://ext.example/b|2> \u{2022} <https://x.com/docs/c|3>"
    );
}

fn envelope_with_event(event: Value) -> SlackSocketEnvelope {
    SlackSocketEnvelope {
        envelope_id: "env1".to_string(),
        envelope_type: "events_api".to_string(),
        payload: json!({
            "type": "event_callback",
            "event_id": "Ev1",
            "event": event,
        }),
    }
}

#[test]
fn unit_normalize_socket_envelope_maps_mentions_and_dms() {
    let mention = envelope_with_event(json!({
        "type": "app_mention",
        "user": "U1",
        "channel": "C1",
        "text": "<@UBOT> hi",
        "ts": "199.1",
    }));
    let event = normalize_socket_envelope(&mention, "UBOT")
        .expect("normalize mention")
        .expect("mention event");
    assert_eq!(event.kind, SlackBridgeEventKind::AppMention);
    assert_eq!(event.key, "Ev1:C1:199.1");
    assert_eq!(event.reply_thread_ts(), Some("199.1"));

    let dm = envelope_with_event(json!({
        "type": "message",
        "channel_type": "im",
        "user": "U2",
        "channel": "D123",
        "text": "hello",
        "ts": "199.2",
    }));
    let event = normalize_socket_envelope(&dm, "UBOT")
        .expect("normalize dm")
        .expect("dm event");
    assert_eq!(event.kind, SlackBridgeEventKind::DirectMessage);
    assert_eq!(event.reply_thread_ts(), None);
}

#[test]
fn unit_normalize_socket_envelope_prefers_existing_thread() {
    let mention = envelope_with_event(json!({
        "type": "app_mention",
        "user": "U1",
        "channel": "C1",
        "text": "<@UBOT> hi",
        "ts": "199.5",
        "thread_ts": "100.0",
    }));
    let event = normalize_socket_envelope(&mention, "UBOT")
        .expect("normalize")
        .expect("event");
    assert_eq!(event.reply_thread_ts(), Some("100.0"));
}

#[test]
fn regression_normalize_socket_envelope_filters_bot_traffic() {
    let own_message = envelope_with_event(json!({
        "type": "app_mention",
        "user": "UBOT",
        "channel": "C1",
        "text": "echo",
        "ts": "1.1",
    }));
    assert!(normalize_socket_envelope(&own_message, "UBOT")
        .expect("normalize")
        .is_none());

    let bot_subtype = envelope_with_event(json!({
        "type": "message",
        "channel_type": "im",
        "subtype": "bot_message",
        "user": "U1",
        "channel": "D1",
        "text": "automated",
        "ts": "1.2",
    }));
    assert!(normalize_socket_envelope(&bot_subtype, "UBOT")
        .expect("normalize")
        .is_none());

    let bot_authored = envelope_with_event(json!({
        "type": "message",
        "channel_type": "im",
        "bot_id": "B9",
        "user": "U1",
        "channel": "D1",
        "text": "automated",
        "ts": "1.3",
    }));
    assert!(normalize_socket_envelope(&bot_authored, "UBOT")
        .expect("normalize")
        .is_none());

    let other_channel_message = envelope_with_event(json!({
        "type": "message",
        "user": "U1",
        "channel": "C1",
        "text": "ambient chatter",
        "ts": "1.4",
    }));
    assert!(normalize_socket_envelope(&other_channel_message, "UBOT")
        .expect("normalize")
        .is_none());
}

#[test]
fn unit_parse_socket_envelope_handles_text_binary_and_ping() {
    let payload = json!({
        "envelope_id": "1",
        "type": "events_api",
        "payload": {
            "type": "event_callback",
            "event_id": "Ev1",
            "event": {
                "type": "app_mention",
                "user": "U1",
                "channel": "C1",
                "text": "hi",
                "ts": "10.0",
            },
        },
    })
    .to_string();

    let parsed = parse_socket_envelope(WsMessage::Text(payload.clone().into())).expect("text");
    assert!(parsed.is_some());

    let parsed = parse_socket_envelope(WsMessage::Binary(payload.into_bytes().into()))
        .expect("binary");
    assert!(parsed.is_some());

    assert!(parse_socket_envelope(WsMessage::Ping(vec![].into()))
        .expect("ping")
        .is_none());
}

#[test]
fn regression_processed_event_set_caps_history() {
    let mut set = ProcessedEventSet::new(2);
    assert!(set.mark_processed("a"));
    assert!(!set.mark_processed("a"));
    assert!(set.mark_processed("b"));
    assert!(set.mark_processed("c"));
    // "a" has been evicted and counts as new again.
    assert!(set.mark_processed("a"));
}

#[test]
fn unit_strip_bot_mention_removes_token_and_trims() {
    assert_eq!(strip_bot_mention("<@UBOT> how do I deploy?", "UBOT"), "how do I deploy?");
    assert_eq!(strip_bot_mention("no mention here", "UBOT"), "no mention here");
}

#[test]
fn functional_render_thread_context_labels_senders_and_skips_current() {
    let messages = vec![
        ThreadMessage {
            text: Some("how do I install?".to_string()),
            ..ThreadMessage::default()
        },
        ThreadMessage {
            text: Some("Run the installer.".to_string()),
            bot_id: Some("B1".to_string()),
            ..ThreadMessage::default()
        },
        ThreadMessage {
            text: Some("and on linux?".to_string()),
            ..ThreadMessage::default()
        },
    ];
    assert_eq!(
        render_thread_context(&messages).expect("context"),
        "Previous conversation context:\nUser: how do I install?\nAssistant: Run the installer."
    );
}

#[test]
fn regression_render_thread_context_requires_prior_messages() {
    let only_current = vec![ThreadMessage {
        text: Some("first question".to_string()),
        ..ThreadMessage::default()
    }];
    assert!(render_thread_context(&only_current).is_none());
    assert!(render_thread_context(&[]).is_none());
}

#[test]
fn unit_compose_question_joins_context_and_message() {
    assert_eq!(compose_question(None, "plain"), "plain");
    assert_eq!(
        compose_question(Some("Previous conversation context:\nUser: hi"), "next"),
        "Previous conversation context:\nUser: hi\n\nCurrent message: next"
    );
}

#[tokio::test]
async fn integration_slack_api_client_posts_and_updates_messages() {
    let server = MockServer::start();
    let post = server.mock(|when, then| {
        when.method(POST)
            .path("/chat.postMessage")
            .body_includes("\"channel\":\"C1\"")
            .body_includes("\"thread_ts\":\"9.9\"");
        then.status(200)
            .json_body(json!({"ok": true, "channel": "C1", "ts": "2.0"}));
    });
    let update = server.mock(|when, then| {
        when.method(POST)
            .path("/chat.update")
            .body_includes("\"ts\":\"2.0\"")
            .body_includes("\"blocks\"");
        then.status(200)
            .json_body(json!({"ok": true, "channel": "C1", "ts": "2.0"}));
    });

    let client = SlackApiClient::new(
        server.base_url(),
        "xapp-test".to_string(),
        "xoxb-test".to_string(),
        2_000,
    )
    .expect("client");

    let posted = client
        .post_message("C1", "hello", Some("9.9"))
        .await
        .expect("post");
    assert_eq!(posted, PostedMessage {
        channel: "C1".to_string(),
        ts: "2.0".to_string(),
    });

    client
        .update_message(
            "C1",
            "2.0",
            "updated",
            Some(vec![json!({"type": "markdown", "text": "updated"})]),
        )
        .await
        .expect("update");

    post.assert();
    update.assert();
}

#[tokio::test]
async fn regression_slack_api_client_surfaces_api_errors() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/chat.postMessage");
        then.status(200)
            .json_body(json!({"ok": false, "error": "channel_not_found"}));
    });

    let client = SlackApiClient::new(
        server.base_url(),
        "xapp-test".to_string(),
        "xoxb-test".to_string(),
        2_000,
    )
    .expect("client");

    let error = client
        .post_message("C404", "hello", None)
        .await
        .expect_err("should fail");
    assert!(error.to_string().contains("channel_not_found"));
}

#[tokio::test]
async fn integration_fetch_thread_replies_decodes_messages() {
    let server = MockServer::start();
    let replies = server.mock(|when, then| {
        when.method(GET)
            .path("/conversations.replies")
            .query_param("channel", "C1")
            .query_param("ts", "7.7")
            .query_param("limit", "50");
        then.status(200).json_body(json!({
            "ok": true,
            "messages": [
                {"text": "question", "user": "U1"},
                {"text": "answer", "bot_id": "B1"},
            ],
        }));
    });

    let client = SlackApiClient::new(
        server.base_url(),
        "xapp-test".to_string(),
        "xoxb-test".to_string(),
        2_000,
    )
    .expect("client");

    let messages = client
        .fetch_thread_replies("C1", "7.7", 50)
        .await
        .expect("replies");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text.as_deref(), Some("question"));
    assert!(messages[1].bot_id.is_some());
    replies.assert();
}

struct CountingLookup {
    calls: AtomicUsize,
    config: WorkspaceConfig,
}

#[async_trait]
impl WorkspaceConfigLookup for CountingLookup {
    async fn workspace_config(&self, _team_id: &str) -> Result<Option<WorkspaceConfig>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(self.config.clone()))
    }
}

fn test_workspace_config() -> WorkspaceConfig {
    WorkspaceConfig {
        assistant_api_base: "https://assistant.example/v1/assistant/acme".to_string(),
        assistant_api_key: "mint_test_key".to_string(),
        docs_base_url: Some("https://acme.example/docs".to_string()),
    }
}

fn test_runtime_config(lookup: Arc<dyn WorkspaceConfigLookup>) -> SlackBridgeRuntimeConfig {
    SlackBridgeRuntimeConfig {
        api_base: "http://127.0.0.1:9/api".to_string(),
        app_token: "xapp-test".to_string(),
        bot_token: "xoxb-test".to_string(),
        bot_user_id: Some("UBOT".to_string()),
        team_id: Some("T1".to_string()),
        request_timeout_ms: 2_000,
        assistant_request_timeout_ms: 2_000,
        status_interval: Duration::from_millis(1_000),
        reconnect_delay: Duration::from_millis(10),
        processed_event_cap: 32,
        thread_history_limit: 50,
        config_cache_ttl_ms: 600_000,
        config_lookup: lookup,
    }
}

#[tokio::test]
async fn functional_workspace_config_lookup_is_memoized() {
    let lookup = Arc::new(CountingLookup {
        calls: AtomicUsize::new(0),
        config: test_workspace_config(),
    });
    let runtime = SlackBridgeRuntime::new(test_runtime_config(lookup.clone()))
        .await
        .expect("runtime");

    let first = runtime.workspace_config().await.expect("first lookup");
    let second = runtime.workspace_config().await.expect("second lookup");
    assert_eq!(first, second);
    assert_eq!(first, Some(test_workspace_config()));
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unit_static_workspace_lookup_serves_any_team() {
    let lookup = StaticWorkspaceLookup::new(test_workspace_config());
    let config = lookup.workspace_config("T_ANY").await.expect("lookup");
    assert_eq!(config, Some(test_workspace_config()));
}
