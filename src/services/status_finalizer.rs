//! One-way run status transitions.
//!
//! Engine exit and cancellation end a run through [`StatusFinalizer::finalize`];
//! the heartbeat sweep uses [`StatusFinalizer::fail_if_stale`], which also
//! re-checks the last heartbeat. The storage layer applies each transition
//! with a conditional update, so whichever finalizer lands first wins and the
//! rest observe [`FinalizeOutcome::AlreadyTerminal`].

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Run, RunStatus};
use crate::domain::ports::RunRepository;
use crate::services::event_bus::{EventBus, EventPayload};

/// Result of a finalize attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// This call moved the run to the requested status.
    Applied,
    /// The run was already terminal; nothing changed.
    AlreadyTerminal(RunStatus),
}

pub struct StatusFinalizer {
    runs: Arc<dyn RunRepository>,
    event_bus: Arc<EventBus>,
}

impl StatusFinalizer {
    pub fn new(runs: Arc<dyn RunRepository>, event_bus: Arc<EventBus>) -> Self {
        Self { runs, event_bus }
    }

    async fn load(&self, run_id: Uuid) -> DomainResult<Run> {
        self.runs
            .get(run_id)
            .await?
            .ok_or(DomainError::RunNotFound(run_id))
    }

    /// Move a pending run to running. A run already running is left alone;
    /// a terminal run is an invalid transition.
    pub async fn mark_running(&self, run_id: Uuid) -> DomainResult<Run> {
        if self.runs.mark_running(run_id, Utc::now()).await? {
            tracing::info!(%run_id, "run started");
            self.event_bus.publish(EventPayload::RunStarted { run_id });
            return self.load(run_id).await;
        }

        let run = self.load(run_id).await?;
        match run.status {
            RunStatus::Running => Ok(run),
            from => Err(DomainError::InvalidStatusTransition {
                run_id,
                from,
                to: RunStatus::Running,
            }),
        }
    }

    /// Move a run to a terminal status, at most once.
    pub async fn finalize(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> DomainResult<FinalizeOutcome> {
        if !status.is_terminal() {
            return Err(DomainError::ValidationFailed(format!(
                "cannot finalize run {run_id} as non-terminal status {status}"
            )));
        }

        if self.runs.finalize(run_id, status, error, Utc::now()).await? {
            match status {
                RunStatus::Failed => tracing::warn!(%run_id, error = error.unwrap_or(""), "run failed"),
                _ => tracing::info!(%run_id, %status, "run finalized"),
            }
            self.event_bus.publish(EventPayload::RunFinalized {
                run_id,
                status,
                error: error.map(str::to_string),
            });
            return Ok(FinalizeOutcome::Applied);
        }

        let existing = self.load(run_id).await?;
        tracing::debug!(%run_id, requested = %status, existing = %existing.status, "finalize ignored, run already terminal");
        Ok(FinalizeOutcome::AlreadyTerminal(existing.status))
    }

    /// Fail a running run only if it still has not been seen since
    /// `seen_before`. Returns whether this call failed it.
    pub async fn fail_if_stale(
        &self,
        run_id: Uuid,
        seen_before: DateTime<Utc>,
        error: &str,
    ) -> DomainResult<bool> {
        if !self
            .runs
            .fail_if_stale(run_id, seen_before, error, Utc::now())
            .await?
        {
            tracing::debug!(%run_id, "stale check skipped, run ended or showed life");
            return Ok(false);
        }
        tracing::warn!(%run_id, error, "run failed");
        self.event_bus.publish(EventPayload::RunFinalized {
            run_id,
            status: RunStatus::Failed,
            error: Some(error.to_string()),
        });
        Ok(true)
    }

    pub async fn cancel(&self, run_id: Uuid) -> DomainResult<FinalizeOutcome> {
        self.finalize(run_id, RunStatus::Cancelled, Some("cancelled by operator"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteRunRepository};

    async fn setup() -> (StatusFinalizer, Arc<SqliteRunRepository>) {
        let pool = create_migrated_test_pool().await.unwrap();
        let repo = Arc::new(SqliteRunRepository::new(pool));
        let finalizer = StatusFinalizer::new(repo.clone(), Arc::new(EventBus::default()));
        (finalizer, repo)
    }

    #[tokio::test]
    async fn test_mark_running_is_idempotent() {
        let (finalizer, repo) = setup().await;
        let run = Run::new("T-1");
        repo.create(&run).await.unwrap();

        let first = finalizer.mark_running(run.id).await.unwrap();
        let second = finalizer.mark_running(run.id).await.unwrap();
        assert_eq!(first.status, RunStatus::Running);
        assert_eq!(second.started_at, first.started_at);
    }

    #[tokio::test]
    async fn test_first_finalize_wins() {
        let (finalizer, repo) = setup().await;
        let run = Run::new("T-1");
        repo.create(&run).await.unwrap();
        finalizer.mark_running(run.id).await.unwrap();

        assert_eq!(
            finalizer.finalize(run.id, RunStatus::Completed, None).await.unwrap(),
            FinalizeOutcome::Applied
        );
        assert_eq!(
            finalizer
                .finalize(run.id, RunStatus::Failed, Some("late"))
                .await
                .unwrap(),
            FinalizeOutcome::AlreadyTerminal(RunStatus::Completed)
        );

        let stored = repo.get(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn test_non_terminal_target_is_rejected() {
        let (finalizer, repo) = setup().await;
        let run = Run::new("T-1");
        repo.create(&run).await.unwrap();

        let err = finalizer
            .finalize(run.id, RunStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_mark_running_after_cancel_fails() {
        let (finalizer, repo) = setup().await;
        let run = Run::new("T-1");
        repo.create(&run).await.unwrap();
        finalizer.cancel(run.id).await.unwrap();

        let err = finalizer.mark_running(run.id).await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::InvalidStatusTransition {
                from: RunStatus::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let (finalizer, _repo) = setup().await;
        let err = finalizer
            .finalize(Uuid::new_v4(), RunStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::RunNotFound(_)));
    }
}
