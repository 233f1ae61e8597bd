//! Mintie entry point: validates configuration from flags/environment and
//! runs the Slack bridge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use mintie_slack_runtime::{
    run_slack_bridge, SlackBridgeRuntimeConfig, StaticWorkspaceLookup, WorkspaceConfig,
};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "mintie",
    about = "Slack bridge that answers documentation questions through the Mintlify assistant",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "SLACK_APP_TOKEN",
        hide_env_values = true,
        help = "Slack app-level token used for Socket Mode (xapp-...)."
    )]
    slack_app_token: String,

    #[arg(
        long,
        env = "SLACK_BOT_TOKEN",
        hide_env_values = true,
        help = "Slack bot token used for Web API calls (xoxb-...)."
    )]
    slack_bot_token: String,

    #[arg(
        long,
        env = "MINTLIFY_AUTH_TOKEN",
        hide_env_values = true,
        help = "API key sent as the Authorization header to the assistant."
    )]
    assistant_api_key: String,

    #[arg(
        long,
        env = "MINTLIFY_DOCS_DOMAIN",
        help = "Documentation deployment name appended to the assistant API base."
    )]
    docs_domain: String,

    #[arg(
        long,
        env = "MINTLIFY_DOCS_DOMAIN_URL",
        help = "Documentation site base used to resolve relative links in answers."
    )]
    docs_base_url: Option<String>,

    #[arg(
        long,
        env = "MINTLIFY_API_URL",
        default_value = "https://api-dsc.mintlify.com/v1/assistant",
        help = "Assistant API base URL, without the deployment segment."
    )]
    assistant_api_url: String,

    #[arg(long, env = "SLACK_API_BASE", default_value = "https://slack.com/api")]
    slack_api_base: String,

    #[arg(
        long,
        env = "MINTIE_STATUS_INTERVAL_MS",
        default_value_t = 1_000,
        value_parser = parse_positive_u64,
        help = "Cadence of the thinking-status edits while a reply is pending."
    )]
    status_interval_ms: u64,

    #[arg(
        long,
        env = "MINTIE_SLACK_TIMEOUT_MS",
        default_value_t = 15_000,
        value_parser = parse_positive_u64
    )]
    slack_timeout_ms: u64,

    #[arg(
        long,
        env = "MINTIE_ASSISTANT_TIMEOUT_MS",
        default_value_t = 120_000,
        value_parser = parse_positive_u64
    )]
    assistant_timeout_ms: u64,

    #[arg(
        long,
        env = "MINTIE_RECONNECT_DELAY_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64
    )]
    reconnect_delay_ms: u64,

    #[arg(long, default_value_t = 1_024)]
    processed_event_cap: usize,

    #[arg(long, default_value_t = 50)]
    thread_history_limit: usize,

    #[arg(
        long,
        env = "MINTIE_CONFIG_CACHE_TTL_MS",
        default_value_t = 600_000,
        value_parser = parse_positive_u64
    )]
    config_cache_ttl_ms: u64,
}

impl Cli {
    fn runtime_config(self) -> SlackBridgeRuntimeConfig {
        let assistant_api_base = format!(
            "{}/{}",
            self.assistant_api_url.trim_end_matches('/'),
            self.docs_domain.trim().trim_matches('/')
        );
        let lookup = StaticWorkspaceLookup::new(WorkspaceConfig {
            assistant_api_base,
            assistant_api_key: self.assistant_api_key,
            docs_base_url: self.docs_base_url,
        });

        SlackBridgeRuntimeConfig {
            api_base: self.slack_api_base,
            app_token: self.slack_app_token,
            bot_token: self.slack_bot_token,
            bot_user_id: None,
            team_id: None,
            request_timeout_ms: self.slack_timeout_ms,
            assistant_request_timeout_ms: self.assistant_timeout_ms,
            status_interval: Duration::from_millis(self.status_interval_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            processed_event_cap: self.processed_event_cap,
            thread_history_limit: self.thread_history_limit,
            config_cache_ttl_ms: self.config_cache_ttl_ms,
            config_lookup: Arc::new(lookup),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_slack_bridge(cli.runtime_config()).await
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
