//! Common test utilities for integration tests
//!
//! Builds a fully wired `Foreman` over an in-memory database, a scripted
//! completion provider and a temporary checkpoint directory.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

use foreman::adapters::completion::ScriptedProvider;
use foreman::adapters::sqlite::create_migrated_test_pool;
use foreman::cli::bootstrap::Foreman;
use foreman::domain::errors::DomainResult;
use foreman::domain::models::{Checkpoint, Config, Deployment};
use foreman::domain::ports::CheckpointStore;
use foreman::services::RateLimitRegistry;

/// A wired system plus the handles tests poke at.
pub struct Harness {
    pub foreman: Foreman,
    pub provider: Arc<ScriptedProvider>,
    pub registry: Arc<RateLimitRegistry>,
    _dir: TempDir,
}

/// Configuration tuned for fast tests.
pub fn test_config(dir: &TempDir, deployments: Vec<Deployment>) -> Config {
    let mut config = Config::default();
    config.checkpoint.dir = dir.path().join("checkpoints").display().to_string();
    config.completion.provider = "scripted".to_string();
    config.dispatcher.deployments = deployments;
    config.dispatcher.transient_backoff_ms = 1;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 10;
    config
}

pub async fn harness_with(deployments: Vec<Deployment>, provider: ScriptedProvider) -> Harness {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = test_config(&dir, deployments);
    let pool = create_migrated_test_pool()
        .await
        .expect("Failed to create test pool");
    let provider = Arc::new(provider);
    let registry = Arc::new(RateLimitRegistry::new());
    let foreman = Foreman::assemble(config, pool, provider.clone(), registry.clone())
        .expect("Failed to assemble services");
    Harness {
        foreman,
        provider,
        registry,
        _dir: dir,
    }
}

pub async fn harness() -> Harness {
    harness_with(vec![Deployment::new("primary", 16_000)], ScriptedProvider::new()).await
}

/// Script replies so the pipeline plans two tasks, one needing an API contract.
pub async fn script_two_task_ticket(provider: &ScriptedProvider) {
    provider
        .reply_when(
            "List the implementation tasks",
            "- Add login API endpoint\n- Write user documentation",
        )
        .await;
    provider
        .reply_when("Write an implementation plan", "# Login support\nAdd an endpoint and docs.")
        .await;
    provider
        .reply_when("Reply APPROVED or CHANGES REQUESTED", "APPROVED. Looks good.")
        .await;
}

/// Checkpoint store that keeps a copy of every checkpoint it is handed.
pub struct RecordingCheckpoints {
    inner: Arc<dyn CheckpointStore>,
    saved: Mutex<Vec<Checkpoint>>,
}

impl RecordingCheckpoints {
    pub fn new(inner: Arc<dyn CheckpointStore>) -> Self {
        Self {
            inner,
            saved: Mutex::new(Vec::new()),
        }
    }

    pub fn saved(&self) -> Vec<Checkpoint> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckpointStore for RecordingCheckpoints {
    async fn save(&self, checkpoint: &Checkpoint) -> DomainResult<()> {
        self.saved.lock().unwrap().push(checkpoint.clone());
        self.inner.save(checkpoint).await
    }

    async fn load(&self, run_id: Uuid) -> DomainResult<Option<Checkpoint>> {
        self.inner.load(run_id).await
    }

    async fn delete(&self, run_id: Uuid) -> DomainResult<()> {
        self.inner.delete(run_id).await
    }
}

/// Setup test logging
#[allow(dead_code)]
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
