//! Service wiring shared by every command.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::checkpoint::FileCheckpointStore;
use crate::adapters::collaborators::{FallbackTicketing, NullSourceControl, StubTicketing};
use crate::adapters::completion::{OpenAiCompatibleProvider, ScriptedProvider};
use crate::adapters::github::GitHubClient;
use crate::adapters::sqlite::{
    database_url, initialize_database, PoolConfig, SqliteConversationRepository,
    SqliteRunRepository,
};
use crate::domain::models::Config;
use crate::domain::ports::{CompletionProvider, SourceControlClient, TicketingClient};
use crate::infrastructure::config::ConfigLoader;
use crate::services::{
    CompletionService, ConversationLedger, DeploymentDispatcher, EventBus, HeartbeatMonitor,
    LlmPipelineAgents, PipelineAgents, RateLimitRegistry, StatusFinalizer, TokenGovernor,
    WorkflowEngine,
};

/// Load configuration from `path`, or from the layered `.foreman/` files when unset.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// Every service a command may need, built from one [`Config`].
pub struct Foreman {
    pub config: Config,
    pub pool: SqlitePool,
    pub runs: Arc<SqliteRunRepository>,
    pub event_bus: Arc<EventBus>,
    pub ledger: Arc<ConversationLedger>,
    pub dispatcher: Arc<DeploymentDispatcher>,
    pub completions: Arc<CompletionService>,
    pub finalizer: Arc<StatusFinalizer>,
    pub heartbeat: Arc<HeartbeatMonitor>,
    pub checkpoints: Arc<FileCheckpointStore>,
    agents: Arc<dyn PipelineAgents>,
}

impl Foreman {
    /// Open the database and wire the services for `config`.
    pub async fn open(config: Config) -> Result<Self> {
        let url = database_url(&config.database.path);
        let pool = initialize_database(&url, Some(PoolConfig::from(&config.database)))
            .await
            .with_context(|| format!("Failed to open database at {}", config.database.path))?;
        let provider = provider_from_config(&config);
        Self::assemble(config, pool, provider, RateLimitRegistry::shared())
    }

    /// Wire the services over an existing pool with a caller-chosen provider
    /// and a private rate-limit registry.
    pub fn assemble(
        config: Config,
        pool: SqlitePool,
        provider: Arc<dyn CompletionProvider>,
        registry: Arc<RateLimitRegistry>,
    ) -> Result<Self> {
        let event_bus = Arc::new(EventBus::default());
        let runs = Arc::new(SqliteRunRepository::new(pool.clone()));
        let ledger = Arc::new(ConversationLedger::new(
            Arc::new(SqliteConversationRepository::new(pool.clone())),
            event_bus.clone(),
            config.retry.clone(),
        ));
        let dispatcher = Arc::new(
            DeploymentDispatcher::new(config.dispatcher.deployments.clone(), registry)
                .context("Invalid deployment pool")?
                .with_default_retry_after(Duration::from_secs(
                    config.dispatcher.default_retry_after_secs,
                )),
        );
        let completions = Arc::new(
            CompletionService::new(
                dispatcher.clone(),
                TokenGovernor::new(config.governor.clone()),
                provider,
                ledger.clone(),
                event_bus.clone(),
                &config.dispatcher,
            )
            .with_quota(&config.rate_limit)
            .with_call_timeout(Duration::from_secs(config.completion.timeout_secs)),
        );
        let finalizer = Arc::new(StatusFinalizer::new(runs.clone(), event_bus.clone()));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            runs.clone(),
            finalizer.clone(),
            event_bus.clone(),
            &config.heartbeat,
        ));
        let checkpoints = Arc::new(FileCheckpointStore::new(&config.checkpoint.dir));

        let (ticketing, source_control) = collaborators_from_config(&config);
        let agents: Arc<dyn PipelineAgents> = Arc::new(
            LlmPipelineAgents::new(completions.clone(), ticketing, source_control)
                .with_workspace_root(config.workspace.root.as_ref().map(PathBuf::from))
                .with_base_branch(config.github.base_branch.clone()),
        );

        Ok(Self {
            config,
            pool,
            runs,
            event_bus,
            ledger,
            dispatcher,
            completions,
            finalizer,
            heartbeat,
            checkpoints,
            agents,
        })
    }

    /// Replace the agents driving each step.
    #[must_use]
    pub fn with_agents(mut self, agents: Arc<dyn PipelineAgents>) -> Self {
        self.agents = agents;
        self
    }

    /// A workflow engine over these services, heartbeating while it runs.
    pub fn engine(&self) -> WorkflowEngine {
        WorkflowEngine::new(
            self.runs.clone(),
            self.checkpoints.clone(),
            self.agents.clone(),
            self.completions.clone(),
            self.finalizer.clone(),
            self.event_bus.clone(),
        )
        .with_heartbeat(self.heartbeat.clone())
    }
}

fn provider_from_config(config: &Config) -> Arc<dyn CompletionProvider> {
    match config.completion.provider.as_str() {
        "scripted" => Arc::new(ScriptedProvider::new()),
        _ => Arc::new(OpenAiCompatibleProvider::from_env(
            config.completion.base_url.clone(),
            &config.completion.api_key_env,
            Duration::from_secs(config.completion.timeout_secs),
        )),
    }
}

fn collaborators_from_config(
    config: &Config,
) -> (Arc<dyn TicketingClient>, Arc<dyn SourceControlClient>) {
    let offline = || -> (Arc<dyn TicketingClient>, Arc<dyn SourceControlClient>) {
        (Arc::new(StubTicketing), Arc::new(NullSourceControl::new()))
    };
    if !config.github.enabled {
        return offline();
    }
    match GitHubClient::from_config(&config.github) {
        Ok(client) => {
            let client = Arc::new(client);
            let ticketing: Arc<dyn TicketingClient> =
                Arc::new(FallbackTicketing::new(client.clone()));
            let source_control: Arc<dyn SourceControlClient> = client;
            (ticketing, source_control)
        }
        Err(e) => {
            tracing::warn!(error = %e, "GitHub disabled, using offline collaborators");
            offline()
        }
    }
}
