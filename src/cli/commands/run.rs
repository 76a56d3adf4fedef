//! Run lifecycle commands.

use anyhow::{anyhow, Context, Result};
use clap::Args;
use comfy_table::Table;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::cli::bootstrap::Foreman;
use crate::cli::id_resolver::resolve_run_id;
use crate::cli::output::{list_table, output, render_list, short_id, truncate, CommandOutput};
use crate::domain::models::{Run, RunFilter, RunStatus, StepLogEntry, StepStatus};
use crate::domain::ports::{CheckpointStore, RunRepository};
use crate::services::{FinalizeOutcome, UnifiedEvent};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Ticket reference to deliver
    pub ticket: String,
    /// Print the run's events as they happen
    #[arg(long)]
    pub follow: bool,
}

#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Run ID or unique prefix
    pub id: String,
    /// Print the run's events as they happen
    #[arg(long)]
    pub follow: bool,
}

#[derive(Args, Debug)]
pub struct RunIdArgs {
    /// Run ID or unique prefix
    pub id: String,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Filter by status (pending, running, completed, failed, cancelled)
    #[arg(short, long)]
    pub status: Option<String>,
    /// Filter by ticket reference
    #[arg(short, long)]
    pub ticket: Option<String>,
    #[arg(short, long, default_value_t = 50)]
    pub limit: u32,
}

#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Keep auditing on the configured interval until interrupted
    #[arg(long)]
    pub watch: bool,
}

#[derive(Debug, Serialize)]
pub struct RunOutput {
    pub id: String,
    pub ticket_ref: String,
    pub status: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub last_heartbeat_at: Option<String>,
    pub error: Option<String>,
}

impl From<&Run> for RunOutput {
    fn from(run: &Run) -> Self {
        let fmt = |t: chrono::DateTime<chrono::Utc>| t.format(TIME_FORMAT).to_string();
        Self {
            id: run.id.to_string(),
            ticket_ref: run.ticket_ref.clone(),
            status: run.status.as_str().to_string(),
            created_at: fmt(run.created_at),
            started_at: run.started_at.map(fmt),
            finished_at: run.finished_at.map(fmt),
            last_heartbeat_at: run.last_heartbeat_at.map(fmt),
            error: run.error.clone(),
        }
    }
}

impl CommandOutput for RunOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![
            "Run Details:".to_string(),
            format!("  ID: {}", self.id),
            format!("  Ticket: {}", self.ticket_ref),
            format!("  Status: {}", self.status),
            format!("  Created at: {}", self.created_at),
        ];
        if let Some(at) = &self.started_at {
            lines.push(format!("  Started at: {at}"));
        }
        if let Some(at) = &self.finished_at {
            lines.push(format!("  Finished at: {at}"));
        }
        if let Some(at) = &self.last_heartbeat_at {
            lines.push(format!("  Last heartbeat: {at}"));
        }
        if let Some(error) = &self.error {
            lines.push(format!("  Error: {error}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct RunListOutput {
    pub runs: Vec<RunOutput>,
    pub total: usize,
}

impl CommandOutput for RunListOutput {
    fn to_human(&self) -> String {
        let mut table: Table = list_table(&["id", "ticket", "status", "created", "error"]);
        for run in &self.runs {
            table.add_row(vec![
                run.id[..8].to_string(),
                truncate(&run.ticket_ref, 24),
                run.status.clone(),
                run.created_at.clone(),
                run.error.as_deref().map(|e| truncate(e, 40)).unwrap_or_default(),
            ]);
        }
        render_list("run", &table, self.total)
    }
}

#[derive(Debug, Serialize)]
pub struct StepOutput {
    pub step: String,
    pub agent: String,
    pub status: String,
    pub timestamp: String,
    pub error: Option<String>,
    pub escalations: usize,
    pub collaborations: usize,
}

impl From<&StepLogEntry> for StepOutput {
    fn from(entry: &StepLogEntry) -> Self {
        Self {
            step: entry.step.as_str().to_string(),
            agent: entry.agent.as_str().to_string(),
            status: match entry.status {
                StepStatus::Completed => "completed".to_string(),
                StepStatus::Failed => "failed".to_string(),
            },
            timestamp: entry.timestamp.format(TIME_FORMAT).to_string(),
            error: entry.error.clone(),
            escalations: entry.escalations.len(),
            collaborations: entry.collaborations.len(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunDetailOutput {
    pub run: RunOutput,
    pub steps: Vec<StepOutput>,
}

impl CommandOutput for RunDetailOutput {
    fn to_human(&self) -> String {
        let mut out = self.run.to_human();
        if self.steps.is_empty() {
            out.push_str("\n\nNo steps recorded.");
            return out;
        }
        let mut table = list_table(&["step", "agent", "status", "handoffs", "error"]);
        for step in &self.steps {
            table.add_row(vec![
                step.step.clone(),
                step.agent.clone(),
                step.status.clone(),
                format!("{}e/{}c", step.escalations, step.collaborations),
                step.error.as_deref().map(|e| truncate(e, 48)).unwrap_or_default(),
            ]);
        }
        out.push_str(&format!("\n\nSteps:\n{table}"));
        out
    }
}

#[derive(Debug, Serialize)]
pub struct MessageOutput {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunOutput>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub run_ids: Vec<String>,
}

impl CommandOutput for MessageOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![self.message.clone()];
        lines.extend(self.run_ids.iter().map(|id| format!("  {id}")));
        lines.join("\n")
    }
}

/// Flip to `true` on Ctrl-C so the engine stops between steps.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current step");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Render one followed event: a JSON line, or a timestamped summary.
pub fn event_line(event: &UnifiedEvent, json: bool) -> String {
    if json {
        return serde_json::to_string(event).unwrap_or_default();
    }
    format!(
        "{} [{:<7}] {:<10} {}",
        event.timestamp.format("%H:%M:%S%.3f"),
        event.severity.as_str(),
        event.category.as_str(),
        event.payload.summary()
    )
}

/// Hand every event for `run_id` (and pool-wide events) to `emit` until
/// `done` flips, then flush what is already buffered.
pub async fn follow_events(
    mut events: broadcast::Receiver<UnifiedEvent>,
    run_id: Uuid,
    mut done: watch::Receiver<bool>,
    mut emit: impl FnMut(&UnifiedEvent),
) {
    let mut forward = |event: &UnifiedEvent| {
        if event.run_id.is_none_or(|id| id == run_id) {
            emit(event);
        }
    };
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => forward(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event follower fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    break;
                }
            }
        }
    }
    loop {
        match events.try_recv() {
            Ok(event) => forward(&event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
}

/// Drive the run, printing its events when `events` is given.
async fn drive_following(
    foreman: &Foreman,
    run_id: Uuid,
    resume: bool,
    events: Option<broadcast::Receiver<UnifiedEvent>>,
    json: bool,
) -> Result<Run> {
    let Some(events) = events else {
        return drive(foreman, run_id, resume).await;
    };
    let (done_tx, done_rx) = watch::channel(false);
    let follower = tokio::spawn(follow_events(events, run_id, done_rx, move |event| {
        println!("{}", event_line(event, json));
    }));
    let result = drive(foreman, run_id, resume).await;
    let _ = done_tx.send(true);
    if let Err(e) = follower.await {
        tracing::warn!(error = %e, "event follower stopped abnormally");
    }
    result
}

async fn drive(foreman: &Foreman, run_id: Uuid, resume: bool) -> Result<Run> {
    let audit = foreman.heartbeat.spawn_audit().ok();
    let engine = foreman.engine().with_shutdown(shutdown_on_ctrl_c());
    let result = engine.run(run_id, resume).await;
    if let Some(audit) = audit {
        audit.stop().await;
    }
    result.with_context(|| format!("Run {run_id} did not finish"))
}

async fn run_detail(foreman: &Foreman, run_id: Uuid) -> Result<RunDetailOutput> {
    let run = foreman
        .runs
        .get(run_id)
        .await?
        .ok_or_else(|| anyhow!("Run {run_id} not found. Use 'foreman list' to see runs."))?;
    let steps = foreman
        .checkpoints
        .load(run_id)
        .await
        .context("Failed to read checkpoint")?
        .map(|c| c.step_log.iter().map(StepOutput::from).collect())
        .unwrap_or_default();
    Ok(RunDetailOutput {
        run: RunOutput::from(&run),
        steps,
    })
}

pub async fn start(args: StartArgs, foreman: &Foreman, json: bool) -> Result<()> {
    let events = args.follow.then(|| foreman.event_bus.subscribe());
    let run = foreman
        .engine()
        .create_run(&args.ticket)
        .await
        .context("Failed to create run")?;
    if !json {
        println!("Run {} created for {}", short_id(&run.id), run.ticket_ref);
    }
    drive_following(foreman, run.id, false, events, json).await?;
    output(&run_detail(foreman, run.id).await?, json);
    Ok(())
}

pub async fn resume(args: ResumeArgs, foreman: &Foreman, json: bool) -> Result<()> {
    let run_id = resolve_run_id(&foreman.pool, &args.id).await?;
    let events = args.follow.then(|| foreman.event_bus.subscribe());
    drive_following(foreman, run_id, true, events, json).await?;
    output(&run_detail(foreman, run_id).await?, json);
    Ok(())
}

pub async fn list(args: ListArgs, foreman: &Foreman, json: bool) -> Result<()> {
    let status = args
        .status
        .as_deref()
        .map(|s| RunStatus::from_str(s).ok_or_else(|| anyhow!("Unknown run status '{s}'")))
        .transpose()?;
    let runs = foreman
        .runs
        .list(RunFilter {
            status,
            ticket_ref: args.ticket,
            limit: Some(args.limit),
            offset: None,
        })
        .await
        .context("Failed to list runs")?;
    let runs: Vec<RunOutput> = runs.iter().map(RunOutput::from).collect();
    let total = runs.len();
    output(&RunListOutput { runs, total }, json);
    Ok(())
}

pub async fn show(args: RunIdArgs, foreman: &Foreman, json: bool) -> Result<()> {
    let run_id = resolve_run_id(&foreman.pool, &args.id).await?;
    output(&run_detail(foreman, run_id).await?, json);
    Ok(())
}

pub async fn cancel(args: RunIdArgs, foreman: &Foreman, json: bool) -> Result<()> {
    let run_id = resolve_run_id(&foreman.pool, &args.id).await?;
    let outcome = foreman.finalizer.cancel(run_id).await?;
    let message = match outcome {
        FinalizeOutcome::Applied => format!("Run {} cancelled.", short_id(&run_id)),
        FinalizeOutcome::AlreadyTerminal(status) => {
            format!("Run {} is already {status}; nothing to cancel.", short_id(&run_id))
        }
    };
    let run = foreman.runs.get(run_id).await?.as_ref().map(RunOutput::from);
    output(
        &MessageOutput {
            message,
            run,
            run_ids: Vec::new(),
        },
        json,
    );
    Ok(())
}

pub async fn reconcile(args: RunIdArgs, foreman: &Foreman, json: bool) -> Result<()> {
    let run_id = resolve_run_id(&foreman.pool, &args.id).await?;
    let run = foreman.heartbeat.reconcile(run_id).await?;
    output(&RunOutput::from(&run), json);
    Ok(())
}

pub async fn audit(args: AuditArgs, foreman: &Foreman, json: bool) -> Result<()> {
    if args.watch {
        let handle = foreman.heartbeat.spawn_audit()?;
        if !json {
            println!(
                "Auditing every {}s (timeout {}s). Press Ctrl-C to stop.",
                foreman.config.heartbeat.audit_interval_secs, foreman.config.heartbeat.timeout_secs
            );
        }
        tokio::signal::ctrl_c().await?;
        handle.stop().await;
        return Ok(());
    }

    let failed = foreman.heartbeat.sweep().await.context("Audit sweep failed")?;
    let message = match failed.len() {
        0 => "No stale runs found.".to_string(),
        n => format!("Failed {n} stale run(s):"),
    };
    output(
        &MessageOutput {
            message,
            run: None,
            run_ids: failed.iter().map(ToString::to_string).collect(),
        },
        json,
    );
    Ok(())
}
