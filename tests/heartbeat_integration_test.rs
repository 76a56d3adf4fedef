//! Zombie-run detection through the wired services.

mod common;

use chrono::Utc;
use std::time::Duration;

use foreman::domain::models::RunStatus;
use foreman::domain::ports::RunRepository;
use foreman::services::EventPayload;

use common::harness;

#[tokio::test]
async fn test_sweep_fails_run_abandoned_by_crashed_process() {
    let h = harness().await;
    let mut events = h.foreman.event_bus.subscribe();
    let engine = h.foreman.engine();
    let run = engine.create_run("T-9").await.unwrap();
    h.foreman.finalizer.mark_running(run.id).await.unwrap();
    h.foreman
        .runs
        .touch_heartbeat(run.id, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();

    let swept = h.foreman.heartbeat.sweep().await.unwrap();
    assert_eq!(swept, vec![run.id]);

    let failed = h.foreman.runs.get(run.id).await.unwrap().unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(failed.error.as_deref().unwrap_or("").contains("heartbeat timeout"));

    let mut timed_out = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event.payload, EventPayload::HeartbeatTimedOut { run_id, .. } if run_id == run.id)
        {
            timed_out = true;
        }
    }
    assert!(timed_out);

    // A later resume leaves the swept run alone.
    let resumed = engine.run(run.id, true).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Failed);
    assert_eq!(resumed.error, failed.error);
    assert!(h.provider.calls().await.is_empty());
}

#[tokio::test]
async fn test_reconcile_keeps_live_run_running() {
    let h = harness().await;
    let run = h.foreman.engine().create_run("T-10").await.unwrap();
    h.foreman.finalizer.mark_running(run.id).await.unwrap();
    h.foreman.runs.touch_heartbeat(run.id, Utc::now()).await.unwrap();

    let reconciled = h.foreman.heartbeat.reconcile(run.id).await.unwrap();
    assert_eq!(reconciled.status, RunStatus::Running);

    h.foreman
        .runs
        .touch_heartbeat(run.id, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    let reconciled = h.foreman.heartbeat.reconcile(run.id).await.unwrap();
    assert_eq!(reconciled.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_heartbeat_task_stamps_running_run() {
    let h = harness().await;
    let run = h.foreman.engine().create_run("T-11").await.unwrap();
    let started = h.foreman.finalizer.mark_running(run.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let handle = h.foreman.heartbeat.start_heartbeat(run.id);
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop().await;

    let stamped = h.foreman.runs.get(run.id).await.unwrap().unwrap();
    assert!(stamped.last_heartbeat_at > started.last_heartbeat_at);
}
