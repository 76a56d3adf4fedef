//! Run repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Run, RunFilter, RunStatus};

/// Repository interface for Run persistence.
///
/// Status-changing operations are conditional and report whether they
/// applied, so callers can tell a no-op from a write.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Insert a new run.
    async fn create(&self, run: &Run) -> DomainResult<()>;

    /// Get a run by ID.
    async fn get(&self, id: Uuid) -> DomainResult<Option<Run>>;

    /// List runs, newest first.
    async fn list(&self, filter: RunFilter) -> DomainResult<Vec<Run>>;

    /// Move a pending run to running. Returns false if the run was not pending.
    async fn mark_running(&self, id: Uuid, at: DateTime<Utc>) -> DomainResult<bool>;

    /// Move a non-terminal run to a terminal status. Returns false if the run
    /// was already terminal.
    async fn finalize(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> DomainResult<bool>;

    /// Fail a running run last seen alive before `seen_before`. Returns false
    /// if the run is no longer running or showed life since.
    async fn fail_if_stale(
        &self,
        id: Uuid,
        seen_before: DateTime<Utc>,
        error: &str,
        at: DateTime<Utc>,
    ) -> DomainResult<bool>;

    /// Stamp the heartbeat of a running run. Returns false if the run is not running.
    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> DomainResult<bool>;

    /// All runs currently in the running state.
    async fn list_running(&self) -> DomainResult<Vec<Run>>;
}
