use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Per-workspace assistant settings, read-only for the bridge.
pub struct WorkspaceConfig {
    /// Assistant API base up to the deployment segment.
    pub assistant_api_base: String,
    pub assistant_api_key: String,
    /// Documentation site base for resolving relative links. `None` uses the
    /// parser's default base.
    pub docs_base_url: Option<String>,
}

#[async_trait]
/// Read-only lookup of a workspace's assistant configuration.
///
/// `Ok(None)` means the workspace has not completed setup; the bridge replies
/// with a setup prompt instead of calling the assistant.
pub trait WorkspaceConfigLookup: Send + Sync {
    async fn workspace_config(&self, team_id: &str) -> Result<Option<WorkspaceConfig>>;
}

/// Single-tenant lookup serving one fixed configuration for every team.
pub struct StaticWorkspaceLookup {
    config: WorkspaceConfig,
}

impl StaticWorkspaceLookup {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkspaceConfigLookup for StaticWorkspaceLookup {
    async fn workspace_config(&self, _team_id: &str) -> Result<Option<WorkspaceConfig>> {
        Ok(Some(self.config.clone()))
    }
}
