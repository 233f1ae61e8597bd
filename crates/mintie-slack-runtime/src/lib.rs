//! Slack Socket Mode bridge runtime for Mintie.
//!
//! Connects to Slack, normalizes mention and direct-message events, and
//! answers each question through a progressive reply: a placeholder message
//! that cycles a thinking status while the documentation assistant generates,
//! then is edited in place with the parsed, Slack-formatted answer.

mod slack_runtime;

pub use slack_runtime::{
    run_slack_bridge, ChatTransport, PostedMessage, ProgressiveReplyController, ReplyPhase,
    SlackApiClient, SlackBridgeRuntimeConfig, StaticWorkspaceLookup, ThreadMessage,
    WorkspaceConfig, WorkspaceConfigLookup,
};
