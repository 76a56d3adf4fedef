//! Run liveness: per-run heartbeat tasks and the zombie-run audit.
//!
//! A running run stamps `last_heartbeat_at` every `interval`. The audit
//! sweep finalizes any running run whose last sign of life is older than
//! `timeout` as failed, so a crashed process never leaves a run stuck in
//! `running`.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{HeartbeatConfig, Run, RunStatus};
use crate::domain::ports::RunRepository;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::status_finalizer::StatusFinalizer;

/// Handle to one run's heartbeat task. Dropping it stops the task.
pub struct HeartbeatHandle {
    run_id: Uuid,
    stop_flag: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop heartbeating and wait for the task to exit.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Handle to the audit task. Dropping it stops the audit.
pub struct AuditHandle {
    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl AuditHandle {
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.active.store(false, Ordering::Release);
    }
}

impl Drop for AuditHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.active.store(false, Ordering::Release);
    }
}

pub struct HeartbeatMonitor {
    runs: Arc<dyn RunRepository>,
    finalizer: Arc<StatusFinalizer>,
    event_bus: Arc<EventBus>,
    interval: Duration,
    timeout: Duration,
    audit_interval: Duration,
    audit_active: Arc<AtomicBool>,
}

impl HeartbeatMonitor {
    pub fn new(
        runs: Arc<dyn RunRepository>,
        finalizer: Arc<StatusFinalizer>,
        event_bus: Arc<EventBus>,
        config: &HeartbeatConfig,
    ) -> Self {
        Self {
            runs,
            finalizer,
            event_bus,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            timeout: Duration::from_secs(config.timeout_secs),
            audit_interval: Duration::from_secs(config.audit_interval_secs.max(1)),
            audit_active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the tick, staleness and audit periods.
    #[must_use]
    pub fn with_timing(mut self, interval: Duration, timeout: Duration, audit: Duration) -> Self {
        self.interval = interval;
        self.timeout = timeout;
        self.audit_interval = audit;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Spawn the heartbeat task for `run_id`.
    ///
    /// The task exits on its own once the run is no longer running.
    pub fn start_heartbeat(&self, run_id: Uuid) -> HeartbeatHandle {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let runs = self.runs.clone();
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                match runs.touch_heartbeat(run_id, Utc::now()).await {
                    Ok(true) => tracing::trace!(%run_id, "heartbeat"),
                    Ok(false) => {
                        tracing::debug!(%run_id, "run no longer running, heartbeat exiting");
                        break;
                    }
                    Err(e) => tracing::warn!(%run_id, error = %e, "heartbeat write failed"),
                }
            }
        });

        HeartbeatHandle {
            run_id,
            stop_flag,
            task: Some(task),
        }
    }

    /// Spawn the periodic audit. Only one audit may be active per monitor.
    pub fn spawn_audit(self: &Arc<Self>) -> DomainResult<AuditHandle> {
        if self
            .audit_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DomainError::ValidationFailed(
                "heartbeat audit is already running".to_string(),
            ));
        }

        let monitor = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(monitor.audit_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match monitor.sweep().await {
                    Ok(failed) if !failed.is_empty() => {
                        tracing::warn!(count = failed.len(), "heartbeat audit failed stale runs");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "heartbeat audit sweep failed"),
                }
            }
        });

        Ok(AuditHandle {
            active: self.audit_active.clone(),
            task: Some(task),
        })
    }

    fn is_stale(&self, run: &Run, now: DateTime<Utc>) -> bool {
        if run.status != RunStatus::Running {
            return false;
        }
        let last_seen = run.last_seen_alive().unwrap_or(run.created_at);
        chrono::Duration::from_std(self.timeout).is_ok_and(|timeout| now - last_seen > timeout)
    }

    async fn fail_stale(&self, run: &Run) -> DomainResult<bool> {
        let last_seen = run.last_seen_alive();
        let detail = match last_seen {
            Some(at) => format!(
                "heartbeat timeout: no heartbeat since {} (timeout {}s)",
                at.to_rfc3339(),
                self.timeout.as_secs()
            ),
            None => format!("heartbeat timeout: run never reported (timeout {}s)", self.timeout.as_secs()),
        };

        let Ok(timeout) = chrono::Duration::from_std(self.timeout) else {
            return Ok(false);
        };
        let failed = self
            .finalizer
            .fail_if_stale(run.id, Utc::now() - timeout, &detail)
            .await?;
        if failed {
            self.event_bus.publish(EventPayload::HeartbeatTimedOut {
                run_id: run.id,
                last_seen,
            });
        }
        Ok(failed)
    }

    /// Fail every running run whose heartbeat is older than the timeout.
    pub async fn sweep(&self) -> DomainResult<Vec<Uuid>> {
        let now = Utc::now();
        let mut failed = Vec::new();
        for run in self.runs.list_running().await? {
            if self.is_stale(&run, now) && self.fail_stale(&run).await? {
                failed.push(run.id);
            }
        }
        Ok(failed)
    }

    /// Apply the staleness check to one run and return its current state.
    pub async fn reconcile(&self, run_id: Uuid) -> DomainResult<Run> {
        let run = self
            .runs
            .get(run_id)
            .await?
            .ok_or(DomainError::RunNotFound(run_id))?;
        if self.is_stale(&run, Utc::now()) {
            self.fail_stale(&run).await?;
            return self
                .runs
                .get(run_id)
                .await?
                .ok_or(DomainError::RunNotFound(run_id));
        }
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteRunRepository};

    async fn setup(timeout: Duration) -> (Arc<HeartbeatMonitor>, Arc<SqliteRunRepository>) {
        let pool = create_migrated_test_pool().await.unwrap();
        let repo = Arc::new(SqliteRunRepository::new(pool));
        let bus = Arc::new(EventBus::default());
        let finalizer = Arc::new(StatusFinalizer::new(repo.clone(), bus.clone()));
        let monitor = HeartbeatMonitor::new(repo.clone(), finalizer, bus, &HeartbeatConfig::default())
            .with_timing(Duration::from_millis(20), timeout, Duration::from_millis(20));
        (Arc::new(monitor), repo)
    }

    async fn running_run(repo: &SqliteRunRepository) -> Run {
        let run = Run::new("T-1");
        repo.create(&run).await.unwrap();
        repo.mark_running(run.id, Utc::now()).await.unwrap();
        run
    }

    #[tokio::test]
    async fn test_sweep_fails_stale_runs_only() {
        let (monitor, repo) = setup(Duration::from_secs(60)).await;
        let stale = running_run(&repo).await;
        let fresh = running_run(&repo).await;
        repo.touch_heartbeat(stale.id, Utc::now() - chrono::Duration::minutes(10))
            .await
            .unwrap();
        repo.touch_heartbeat(fresh.id, Utc::now()).await.unwrap();

        let failed = monitor.sweep().await.unwrap();
        assert_eq!(failed, vec![stale.id]);

        let stale = repo.get(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, RunStatus::Failed);
        assert!(stale.error.unwrap().contains("heartbeat timeout"));
        assert_eq!(
            repo.get(fresh.id).await.unwrap().unwrap().status,
            RunStatus::Running
        );

        assert!(monitor.sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_after_listing_keeps_run_alive() {
        let (monitor, repo) = setup(Duration::from_secs(60)).await;
        let run = running_run(&repo).await;
        repo.touch_heartbeat(run.id, Utc::now() - chrono::Duration::minutes(10))
            .await
            .unwrap();
        let listed = repo.list_running().await.unwrap().pop().unwrap();
        assert!(monitor.is_stale(&listed, Utc::now()));

        // The run's own heartbeat lands between the listing and the failure.
        repo.touch_heartbeat(run.id, Utc::now()).await.unwrap();
        assert!(!monitor.fail_stale(&listed).await.unwrap());
        assert_eq!(
            repo.get(run.id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn test_reconcile_leaves_terminal_runs_alone() {
        let (monitor, repo) = setup(Duration::ZERO).await;
        let run = Run::new("T-2");
        repo.create(&run).await.unwrap();
        repo.finalize(run.id, RunStatus::Completed, None, Utc::now())
            .await
            .unwrap();

        let reconciled = monitor.reconcile(run.id).await.unwrap();
        assert_eq!(reconciled.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_heartbeat_stamps_and_exits_when_run_ends() {
        let (monitor, repo) = setup(Duration::from_secs(60)).await;
        let run = running_run(&repo).await;

        let handle = monitor.start_heartbeat(run.id);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(repo
            .get(run.id)
            .await
            .unwrap()
            .unwrap()
            .last_heartbeat_at
            .is_some());

        repo.finalize(run.id, RunStatus::Completed, None, Utc::now())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("heartbeat task should exit");
    }

    #[tokio::test]
    async fn test_audit_is_singleton() {
        let (monitor, _repo) = setup(Duration::from_secs(60)).await;
        let first = monitor.spawn_audit().unwrap();
        assert!(monitor.spawn_audit().is_err());
        first.stop().await;
        let again = monitor.spawn_audit().unwrap();
        again.stop().await;
    }

    #[tokio::test]
    async fn test_audit_fails_zombie() {
        let (monitor, repo) = setup(Duration::from_millis(1)).await;
        let run = running_run(&repo).await;
        repo.touch_heartbeat(run.id, Utc::now() - chrono::Duration::seconds(5))
            .await
            .unwrap();

        let audit = monitor.spawn_audit().unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if repo.get(run.id).await.unwrap().unwrap().status == RunStatus::Failed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("audit should fail the zombie run");
        audit.stop().await;
    }
}
