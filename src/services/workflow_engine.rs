//! Resumable pipeline state machine.
//!
//! The `WorkflowEngine` walks the fixed step list for one run. After every
//! step it drains the handoff queues, appends the step log entry and persists
//! a checkpoint before moving on; the execute-tasks step also checkpoints
//! after each task. A failing step is recorded and the engine proceeds. On
//! exit the run is always finalized, except when a shutdown signal stops the
//! engine, which leaves the run resumable.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AgentRole, Checkpoint, CollaborationType, EscalationPriority, ExecutionSummary, HandoffStatus,
    PipelineStep, PlannedTask, Run, RunStatus, StepLogEntry, StepLogExt, StepPayload, StepStatus,
    TaskOutcome, TaskOutcomeStatus, TerminalContext,
};
use crate::domain::ports::{CheckpointStore, RunRepository};
use crate::services::completion_service::CompletionService;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::handoff_router::{CollaborationHandler, EscalationHandler, HandoffRouter};
use crate::services::heartbeat_monitor::HeartbeatMonitor;
use crate::services::pipeline_agents::{
    AgentCollaborationHandler, AgentEscalationHandler, PipelineAgents, StepContext,
};
use crate::services::status_finalizer::StatusFinalizer;

/// Why the step loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Every remaining step ran.
    Finished,
    /// Shutdown was requested; the run stays resumable.
    Interrupted,
    /// Something else moved the run to a terminal status.
    Stopped(RunStatus),
}

enum StepResult {
    Done(StepLogEntry),
    Interrupted,
}

pub struct WorkflowEngine {
    runs: Arc<dyn RunRepository>,
    checkpoints: Arc<dyn CheckpointStore>,
    agents: Arc<dyn PipelineAgents>,
    completions: Arc<CompletionService>,
    finalizer: Arc<StatusFinalizer>,
    event_bus: Arc<EventBus>,
    heartbeat: Option<Arc<HeartbeatMonitor>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl WorkflowEngine {
    pub fn new(
        runs: Arc<dyn RunRepository>,
        checkpoints: Arc<dyn CheckpointStore>,
        agents: Arc<dyn PipelineAgents>,
        completions: Arc<CompletionService>,
        finalizer: Arc<StatusFinalizer>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            runs,
            checkpoints,
            agents,
            completions,
            finalizer,
            event_bus,
            heartbeat: None,
            shutdown: None,
        }
    }

    #[must_use]
    pub fn with_heartbeat(mut self, monitor: Arc<HeartbeatMonitor>) -> Self {
        self.heartbeat = Some(monitor);
        self
    }

    /// Stop between steps and tasks once `shutdown` reads `true`.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Register a new pending run for `ticket_ref`.
    pub async fn create_run(&self, ticket_ref: &str) -> DomainResult<Run> {
        let ticket_ref = ticket_ref.trim();
        if ticket_ref.is_empty() {
            return Err(DomainError::ValidationFailed(
                "ticket reference must not be empty".to_string(),
            ));
        }
        let run = Run::new(ticket_ref);
        self.runs.create(&run).await?;
        tracing::info!(run_id = %run.id, ticket = %run.ticket_ref, "run created");
        self.event_bus
            .publish(EventPayload::RunCreated { run: run.clone() });
        Ok(run)
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn build_router(&self, run_id: Uuid) -> HandoffRouter {
        let collaborations: Arc<dyn CollaborationHandler> =
            Arc::new(AgentCollaborationHandler::new(self.completions.clone()));
        let escalations: Arc<dyn EscalationHandler> =
            Arc::new(AgentEscalationHandler::new(self.completions.clone()));

        let mut router = HandoffRouter::new(run_id, self.event_bus.clone());
        for kind in [
            CollaborationType::InterfaceContract,
            CollaborationType::UiSpecification,
            CollaborationType::DataModelSpecification,
        ] {
            router = router.with_collaboration_handler(kind, collaborations.clone());
        }
        for role in [AgentRole::Architect, AgentRole::Planner, AgentRole::Reviewer] {
            router = router.with_escalation_handler(role, escalations.clone());
        }
        router
    }

    /// Drive `run_id` to completion, resuming from its checkpoint when `resume` is set.
    ///
    /// Terminal runs are returned unchanged.
    pub async fn run(&self, run_id: Uuid, resume: bool) -> DomainResult<Run> {
        let run = self
            .runs
            .get(run_id)
            .await?
            .ok_or(DomainError::RunNotFound(run_id))?;
        if run.is_terminal() {
            tracing::info!(%run_id, status = %run.status, "run already terminal");
            return Ok(run);
        }

        let run = self.finalizer.mark_running(run_id).await?;
        let heartbeat = self.heartbeat.as_ref().map(|m| m.start_heartbeat(run_id));
        let router = self.build_router(run_id);

        let (state, outcome) = match self.load_state(run_id, resume, &router).await {
            Ok(mut state) => {
                let outcome = self.execute(&run, &router, &mut state).await;
                (state, outcome)
            }
            Err(e) => (Checkpoint::new(run_id), Err(e)),
        };

        if let Some(handle) = heartbeat {
            handle.stop().await;
        }

        match outcome {
            Ok(Exit::Finished) => self.finish(&run, &state).await?,
            Ok(Exit::Interrupted) => {
                tracing::info!(%run_id, steps_done = state.step_log.len(), "engine interrupted, run left resumable");
            }
            Ok(Exit::Stopped(status)) => {
                tracing::info!(%run_id, %status, "run stopped externally");
            }
            Err(e) => {
                tracing::error!(%run_id, error = %e, "run aborted");
                let message = e.to_string();
                self.finalizer
                    .finalize(run_id, RunStatus::Failed, Some(&message))
                    .await?;
                self.write_terminal_message(&run, &state, TerminalContext::new(run_id, message))
                    .await;
            }
        }

        self.runs
            .get(run_id)
            .await?
            .ok_or(DomainError::RunNotFound(run_id))
    }

    /// Checkpointed progress to start from, with the handoff queues restored.
    async fn load_state(
        &self,
        run_id: Uuid,
        resume: bool,
        router: &HandoffRouter,
    ) -> DomainResult<Checkpoint> {
        if !resume {
            return Ok(Checkpoint::new(run_id));
        }
        let state = match self.checkpoints.load(run_id).await? {
            Some(checkpoint) => {
                tracing::info!(%run_id, steps_done = checkpoint.step_log.len(), "resuming from checkpoint");
                checkpoint
            }
            None => {
                tracing::info!(%run_id, "no checkpoint found, starting fresh");
                Checkpoint::new(run_id)
            }
        };
        router
            .restore(
                state.collaboration_queue.clone(),
                state.escalation_queue.clone(),
            )
            .await;
        Ok(state)
    }

    async fn execute(
        &self,
        run: &Run,
        router: &HandoffRouter,
        state: &mut Checkpoint,
    ) -> DomainResult<Exit> {
        let start = match state.step_log.last() {
            Some(last) => match last.step.next() {
                Some(next) => next.index(),
                None => return Ok(Exit::Finished),
            },
            None => 0,
        };

        for step in &PipelineStep::ALL[start..] {
            if self.shutdown_requested() {
                return Ok(Exit::Interrupted);
            }
            if let Some(current) = self.runs.get(run.id).await? {
                if current.is_terminal() {
                    return Ok(Exit::Stopped(current.status));
                }
            }

            let entry = match self.run_step(*step, run, router, state).await? {
                StepResult::Done(entry) => entry,
                StepResult::Interrupted => return Ok(Exit::Interrupted),
            };

            state.step_log.push(entry.clone());
            state.task_progress.clear();
            state.step_mark = None;
            self.save_checkpoint(router, state).await?;
            self.event_bus.publish(EventPayload::StepCompleted {
                run_id: run.id,
                entry,
            });
        }
        Ok(Exit::Finished)
    }

    async fn save_checkpoint(&self, router: &HandoffRouter, state: &mut Checkpoint) -> DomainResult<()> {
        let (collaborations, escalations) = router.snapshot().await;
        state.collaboration_queue = collaborations;
        state.escalation_queue = escalations;
        state.timestamp = Utc::now();
        self.checkpoints.save(state).await
    }

    #[instrument(skip(self, run, router, state), fields(run_id = %run.id, step = %step))]
    async fn run_step(
        &self,
        step: PipelineStep,
        run: &Run,
        router: &HandoffRouter,
        state: &mut Checkpoint,
    ) -> DomainResult<StepResult> {
        // A checkpoint written mid-step keeps the mark so restored handoffs
        // still count toward this step.
        let mark = match state.step_mark {
            Some(mark) => mark,
            None => {
                let mark = router.mark().await;
                state.step_mark = Some(mark);
                mark
            }
        };
        let mut drained = None;

        let result: DomainResult<StepPayload> = match step {
            PipelineStep::ExecuteTasks => match state.step_log.breakdown().cloned() {
                Some(breakdown) => {
                    match self.execute_tasks(run, router, state, &breakdown.tasks).await? {
                        Some(summary) => Ok(StepPayload::TasksExecuted(summary)),
                        None => return Ok(StepResult::Interrupted),
                    }
                }
                None => Err(DomainError::ValidationFailed(
                    "no task breakdown available".to_string(),
                )),
            },
            PipelineStep::DrainCollaborations => {
                let report = router.drain().await;
                router
                    .fail_unresolved("handoff unresolved after drain")
                    .await;
                let summary = report.summary();
                drained = Some(report);
                Ok(StepPayload::CollaborationsDrained(summary))
            }
            _ => {
                let ctx = StepContext {
                    run,
                    log: &state.step_log,
                    router,
                };
                self.run_agent_step(step, &ctx).await
            }
        };

        // Collaborations from the breakdown wait for the dedicated drain step.
        if step != PipelineStep::DrainCollaborations && step.next() != Some(PipelineStep::DrainCollaborations) {
            router.drain().await;
            router
                .fail_unresolved(&format!("handoff unresolved after {step}"))
                .await;
        }

        let (escalations, collaborations) = match drained {
            Some(report) => (report.escalations, report.collaborations),
            None => router.since(mark).await,
        };

        let mut entry = match result {
            Ok(payload) => StepLogEntry::completed(step, payload),
            Err(e) => {
                tracing::warn!(error = %e, "step failed");
                StepLogEntry::failed(step, e.to_string())
            }
        };

        let failed_handoffs = escalations
            .iter()
            .filter(|e| e.status == HandoffStatus::Failed)
            .count()
            + collaborations
                .iter()
                .filter(|c| c.status == HandoffStatus::Failed)
                .count();
        if failed_handoffs > 0 && !entry.is_failed() {
            entry.status = StepStatus::Failed;
            entry.error = Some(format!("{failed_handoffs} handoff(s) failed during {step}"));
        }
        if let Some(StepPayload::TasksExecuted(summary)) = &entry.detail {
            let failed = summary.failed_count();
            if failed > 0 && !entry.is_failed() {
                entry.status = StepStatus::Failed;
                entry.error = Some(format!(
                    "{failed} of {} task(s) failed",
                    summary.outcomes.len()
                ));
            }
        }
        entry.escalations = escalations;
        entry.collaborations = collaborations;

        tracing::info!(status = ?entry.status, "step finished");
        Ok(StepResult::Done(entry))
    }

    async fn run_agent_step(&self, step: PipelineStep, ctx: &StepContext<'_>) -> DomainResult<StepPayload> {
        let agents = &self.agents;
        match step {
            PipelineStep::RetrieveTicket => agents
                .retrieve_ticket(ctx)
                .await
                .map(StepPayload::TicketAnalyzed),
            PipelineStep::IndexCodebase => agents
                .index_codebase(ctx)
                .await
                .map(StepPayload::CodebaseIndexed),
            PipelineStep::GeneratePlan => agents
                .generate_plan(ctx)
                .await
                .map(StepPayload::PlanGenerated),
            PipelineStep::BreakDownTasks => agents
                .break_down_tasks(ctx)
                .await
                .map(StepPayload::TasksBrokenDown),
            PipelineStep::FinalReview => {
                let execution = ctx.log.execution().cloned().unwrap_or_default();
                agents
                    .final_review(ctx, &execution)
                    .await
                    .map(StepPayload::ReviewCompleted)
            }
            PipelineStep::DrainCollaborations | PipelineStep::ExecuteTasks => Err(
                DomainError::ValidationFailed(format!("{step} is not an agent step")),
            ),
        }
    }

    /// Run every planned task not already in the checkpoint.
    ///
    /// Returns `Ok(None)` when interrupted by shutdown.
    async fn execute_tasks(
        &self,
        run: &Run,
        router: &HandoffRouter,
        state: &mut Checkpoint,
        tasks: &[PlannedTask],
    ) -> DomainResult<Option<ExecutionSummary>> {
        for task in tasks {
            if state.task_progress.contains_key(&task.id) {
                tracing::debug!(task_id = %task.id, "task already done, skipping");
                continue;
            }
            if self.shutdown_requested() {
                return Ok(None);
            }

            let result = {
                let ctx = StepContext {
                    run,
                    log: &state.step_log,
                    router,
                };
                self.agents.execute_task(&ctx, task).await
            };
            let outcome = match result {
                Ok(artifact) => TaskOutcome {
                    task_id: task.id.clone(),
                    title: task.title.clone(),
                    status: TaskOutcomeStatus::Completed,
                    artifact: Some(artifact),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "task failed, escalating");
                    router
                        .escalate(
                            AgentRole::Implementer,
                            AgentRole::Architect,
                            format!("task {} failed: {e}", task.id),
                            serde_json::json!({
                                "task_id": task.id,
                                "title": task.title,
                                "error": e.to_string(),
                                "step": PipelineStep::ExecuteTasks.as_str(),
                            }),
                            EscalationPriority::High,
                        )
                        .await;
                    TaskOutcome {
                        task_id: task.id.clone(),
                        title: task.title.clone(),
                        status: TaskOutcomeStatus::Failed,
                        artifact: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            state.task_progress.insert(task.id.clone(), outcome);
            self.save_checkpoint(router, state).await?;
        }

        let outcomes = tasks
            .iter()
            .filter_map(|t| state.task_progress.get(&t.id).cloned())
            .collect();
        Ok(Some(ExecutionSummary { outcomes }))
    }

    /// Finalize a run whose steps all ran.
    async fn finish(&self, run: &Run, state: &Checkpoint) -> DomainResult<()> {
        let failed: Vec<&str> = state
            .step_log
            .iter()
            .filter(|e| e.is_failed())
            .map(|e| e.step.as_str())
            .collect();

        if failed.is_empty() {
            self.finalizer
                .finalize(run.id, RunStatus::Completed, None)
                .await?;
            return Ok(());
        }

        let mut message = format!("steps failed: {}", failed.join(", "));
        if let Some(last) = state.step_log.last_error() {
            message.push_str(&format!("; last error: {last}"));
        }
        self.finalizer
            .finalize(run.id, RunStatus::Failed, Some(&message))
            .await?;
        self.write_terminal_message(run, state, TerminalContext::new(run.id, message))
            .await;
        Ok(())
    }

    /// Best-effort terminal message in the orchestrator's conversation for the last step.
    async fn write_terminal_message(&self, run: &Run, state: &Checkpoint, context: TerminalContext) {
        let step = state
            .step_log
            .last()
            .map_or(PipelineStep::RetrieveTicket, |e| e.step);
        let ledger = self.completions.ledger();
        let result = async {
            let conversation = ledger
                .get_or_create_conversation(run.id, AgentRole::Orchestrator, step)
                .await?;
            ledger.create_terminal_message(&conversation, &context).await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(run_id = %run.id, error = %e, "failed to write terminal message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::checkpoint::FileCheckpointStore;
    use crate::adapters::completion::ScriptedProvider;
    use crate::adapters::sqlite::{
        create_migrated_test_pool, SqliteConversationRepository, SqliteRunRepository,
    };
    use crate::domain::models::{
        CodebaseIndex, Deployment, DispatcherConfig, FileChange, GovernorConfig,
        ImplementationPlan, RetryConfig, ReviewOutcome, ReviewVerdict,
        TaskBreakdown, TicketAnalysis,
    };
    use crate::services::conversation_ledger::ConversationLedger;
    use crate::services::deployment_dispatcher::{DeploymentDispatcher, RateLimitRegistry};
    use crate::services::token_governor::TokenGovernor;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Agents with canned answers that count invocations per step.
    #[derive(Default)]
    struct FakeAgents {
        calls: Mutex<HashMap<&'static str, usize>>,
        fail_plan: bool,
        fail_task: Option<&'static str>,
    }

    impl FakeAgents {
        fn hit(&self, name: &'static str) {
            *self.calls.lock().unwrap().entry(name).or_default() += 1;
        }

        fn count(&self, name: &str) -> usize {
            self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl PipelineAgents for FakeAgents {
        async fn retrieve_ticket(&self, ctx: &StepContext<'_>) -> DomainResult<TicketAnalysis> {
            self.hit("retrieve_ticket");
            Ok(TicketAnalysis {
                ticket_id: ctx.run.ticket_ref.clone(),
                title: "Add login".into(),
                summary: "Users log in".into(),
                placeholder: false,
            })
        }

        async fn index_codebase(&self, _ctx: &StepContext<'_>) -> DomainResult<CodebaseIndex> {
            self.hit("index_codebase");
            Ok(CodebaseIndex::default())
        }

        async fn generate_plan(&self, _ctx: &StepContext<'_>) -> DomainResult<ImplementationPlan> {
            self.hit("generate_plan");
            if self.fail_plan {
                return Err(DomainError::CompletionFailed {
                    deployment: "a".into(),
                    message: "boom".into(),
                });
            }
            Ok(ImplementationPlan {
                summary: "plan".into(),
                content: "plan".into(),
            })
        }

        async fn break_down_tasks(&self, _ctx: &StepContext<'_>) -> DomainResult<TaskBreakdown> {
            self.hit("break_down_tasks");
            Ok(TaskBreakdown {
                tasks: vec![
                    PlannedTask {
                        id: "task-1".into(),
                        title: "one".into(),
                        needs: None,
                    },
                    PlannedTask {
                        id: "task-2".into(),
                        title: "two".into(),
                        needs: None,
                    },
                ],
            })
        }

        async fn execute_task(
            &self,
            _ctx: &StepContext<'_>,
            task: &PlannedTask,
        ) -> DomainResult<FileChange> {
            self.hit("execute_task");
            if self.fail_task == Some(task.id.as_str()) {
                return Err(DomainError::ValidationFailed("cannot do it".into()));
            }
            Ok(FileChange {
                path: format!("{}.md", task.id),
                content: task.title.clone(),
            })
        }

        async fn final_review(
            &self,
            _ctx: &StepContext<'_>,
            _execution: &ExecutionSummary,
        ) -> DomainResult<ReviewOutcome> {
            self.hit("final_review");
            Ok(ReviewOutcome {
                verdict: ReviewVerdict::Approved,
                summary: "ok".into(),
                test_report: "ok".into(),
                branch: None,
                pull_request: None,
                check_runs: vec![],
                source_control_error: None,
            })
        }
    }

    struct BrokenCheckpoints;

    #[async_trait]
    impl CheckpointStore for BrokenCheckpoints {
        async fn save(&self, _checkpoint: &Checkpoint) -> DomainResult<()> {
            Err(DomainError::Checkpoint("disk full".into()))
        }
        async fn load(&self, _run_id: Uuid) -> DomainResult<Option<Checkpoint>> {
            Ok(None)
        }
        async fn delete(&self, _run_id: Uuid) -> DomainResult<()> {
            Ok(())
        }
    }

    /// File store that also keeps a copy of every checkpoint written.
    struct RecordingCheckpoints {
        inner: Arc<FileCheckpointStore>,
        saved: Mutex<Vec<Checkpoint>>,
    }

    impl RecordingCheckpoints {
        fn new(inner: Arc<FileCheckpointStore>) -> Self {
            Self {
                inner,
                saved: Mutex::new(Vec::new()),
            }
        }

        fn saved(&self) -> Vec<Checkpoint> {
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

    struct Fixture {
        runs: Arc<SqliteRunRepository>,
        completions: Arc<CompletionService>,
        finalizer: Arc<StatusFinalizer>,
        bus: Arc<EventBus>,
        _dir: tempfile::TempDir,
        checkpoints: Arc<FileCheckpointStore>,
    }

    async fn fixture() -> Fixture {
        let pool = create_migrated_test_pool().await.unwrap();
        let runs = Arc::new(SqliteRunRepository::new(pool.clone()));
        let bus = Arc::new(EventBus::default());
        let ledger = Arc::new(ConversationLedger::new(
            Arc::new(SqliteConversationRepository::new(pool)),
            bus.clone(),
            RetryConfig::default(),
        ));
        let dispatcher = Arc::new(
            DeploymentDispatcher::new(
                vec![Deployment::new("a", 16_000)],
                Arc::new(RateLimitRegistry::new()),
            )
            .unwrap(),
        );
        let completions = Arc::new(CompletionService::new(
            dispatcher,
            TokenGovernor::new(GovernorConfig::default()),
            Arc::new(ScriptedProvider::new()),
            ledger,
            bus.clone(),
            &DispatcherConfig::default(),
        ));
        let finalizer = Arc::new(StatusFinalizer::new(runs.clone(), bus.clone()));
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = Arc::new(FileCheckpointStore::new(dir.path()));
        Fixture {
            runs,
            completions,
            finalizer,
            bus,
            _dir: dir,
            checkpoints,
        }
    }

    fn engine(f: &Fixture, agents: Arc<FakeAgents>, checkpoints: Arc<dyn CheckpointStore>) -> WorkflowEngine {
        WorkflowEngine::new(
            f.runs.clone(),
            checkpoints,
            agents,
            f.completions.clone(),
            f.finalizer.clone(),
            f.bus.clone(),
        )
    }

    #[tokio::test]
    async fn test_failed_step_is_recorded_and_engine_proceeds() {
        let f = fixture().await;
        let agents = Arc::new(FakeAgents {
            fail_plan: true,
            ..FakeAgents::default()
        });
        let engine = engine(&f, agents.clone(), f.checkpoints.clone());
        let run = engine.create_run("T-7").await.unwrap();

        let done = engine.run(run.id, false).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("generate_plan"));
        assert_eq!(agents.count("final_review"), 1);

        let checkpoint = f.checkpoints.load(run.id).await.unwrap().unwrap();
        assert_eq!(checkpoint.step_log.len(), 7);
        assert!(checkpoint.step_log[2].is_failed());
    }

    #[tokio::test]
    async fn test_failed_task_escalates_and_fails_step() {
        let f = fixture().await;
        let agents = Arc::new(FakeAgents {
            fail_task: Some("task-2"),
            ..FakeAgents::default()
        });
        let engine = engine(&f, agents.clone(), f.checkpoints.clone());
        let run = engine.create_run("T-8").await.unwrap();

        let done = engine.run(run.id, false).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);

        let checkpoint = f.checkpoints.load(run.id).await.unwrap().unwrap();
        let execute = &checkpoint.step_log[PipelineStep::ExecuteTasks.index()];
        assert!(execute.is_failed());
        assert_eq!(execute.escalations.len(), 1);
        assert_eq!(execute.escalations[0].to, AgentRole::Architect);
        assert_eq!(execute.escalations[0].status, HandoffStatus::Completed);
        assert!(checkpoint.task_progress.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_failure_aborts_and_finalizes() {
        let f = fixture().await;
        let agents = Arc::new(FakeAgents::default());
        let engine = engine(&f, agents.clone(), Arc::new(BrokenCheckpoints));
        let run = engine.create_run("T-9").await.unwrap();

        let done = engine.run(run.id, false).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("disk full"));
        assert_eq!(agents.count("index_codebase"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_run_resumable() {
        let f = fixture().await;
        let agents = Arc::new(FakeAgents::default());
        let (tx, rx) = watch::channel(true);
        let engine = engine(&f, agents.clone(), f.checkpoints.clone()).with_shutdown(rx);
        let run = engine.create_run("T-10").await.unwrap();

        let stopped = engine.run(run.id, false).await.unwrap();
        assert_eq!(stopped.status, RunStatus::Running);
        assert_eq!(agents.count("retrieve_ticket"), 0);

        tx.send(false).unwrap();
        let done = engine.run(run.id, true).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_skips_recorded_steps_and_tasks() {
        let f = fixture().await;
        let agents = Arc::new(FakeAgents::default());
        let engine = engine(&f, agents.clone(), f.checkpoints.clone());
        let run = engine.create_run("T-11").await.unwrap();

        // A previous process finished four steps, the drain and one task.
        let mut checkpoint = Checkpoint::new(run.id);
        let log: Vec<StepLogEntry> = vec![
            StepLogEntry::completed(
                PipelineStep::RetrieveTicket,
                StepPayload::TicketAnalyzed(TicketAnalysis {
                    ticket_id: "T-11".into(),
                    title: "t".into(),
                    summary: "s".into(),
                    placeholder: false,
                }),
            ),
            StepLogEntry::completed(
                PipelineStep::IndexCodebase,
                StepPayload::CodebaseIndexed(CodebaseIndex::default()),
            ),
            StepLogEntry::completed(
                PipelineStep::GeneratePlan,
                StepPayload::PlanGenerated(ImplementationPlan {
                    summary: "p".into(),
                    content: "p".into(),
                }),
            ),
            StepLogEntry::completed(
                PipelineStep::BreakDownTasks,
                StepPayload::TasksBrokenDown(TaskBreakdown {
                    tasks: vec![
                        PlannedTask {
                            id: "task-1".into(),
                            title: "one".into(),
                            needs: None,
                        },
                        PlannedTask {
                            id: "task-2".into(),
                            title: "two".into(),
                            needs: None,
                        },
                    ],
                }),
            ),
            StepLogEntry::completed(
                PipelineStep::DrainCollaborations,
                StepPayload::CollaborationsDrained(Default::default()),
            ),
        ];
        checkpoint.step_log = log;
        checkpoint.task_progress.insert(
            "task-1".into(),
            TaskOutcome {
                task_id: "task-1".into(),
                title: "one".into(),
                status: TaskOutcomeStatus::Completed,
                artifact: None,
                error: None,
            },
        );
        f.checkpoints.save(&checkpoint).await.unwrap();

        let done = engine.run(run.id, true).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(agents.count("retrieve_ticket"), 0);
        assert_eq!(agents.count("execute_task"), 1);
        assert_eq!(agents.count("final_review"), 1);

        let saved = f.checkpoints.load(run.id).await.unwrap().unwrap();
        assert_eq!(saved.step_log.len(), 7);
        let execution = saved.step_log.execution().unwrap();
        assert_eq!(execution.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_run_is_returned_unchanged() {
        let f = fixture().await;
        let agents = Arc::new(FakeAgents::default());
        let engine = engine(&f, agents.clone(), f.checkpoints.clone());
        let run = engine.create_run("T-12").await.unwrap();
        f.finalizer.cancel(run.id).await.unwrap();

        let same = engine.run(run.id, true).await.unwrap();
        assert_eq!(same.status, RunStatus::Cancelled);
        assert_eq!(agents.count("retrieve_ticket"), 0);
    }

    #[tokio::test]
    async fn test_empty_ticket_is_rejected() {
        let f = fixture().await;
        let engine = engine(&f, Arc::new(FakeAgents::default()), f.checkpoints.clone());
        assert!(matches!(
            engine.create_run("  ").await,
            Err(DomainError::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_fails_run() {
        let f = fixture().await;
        let agents = Arc::new(FakeAgents::default());
        let engine = engine(&f, agents.clone(), f.checkpoints.clone());
        let run = engine.create_run("T-13").await.unwrap();
        std::fs::create_dir_all(f.checkpoints.dir()).unwrap();
        std::fs::write(f.checkpoints.dir().join(format!("{}.json", run.id)), "{ torn").unwrap();

        let done = engine.run(run.id, true).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("corrupt checkpoint"));
        assert!(done.finished_at.is_some());
        assert_eq!(agents.count("retrieve_ticket"), 0);

        let stored = f.runs.get(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);

        let ledger = f.completions.ledger();
        let conversations = ledger.conversations_for_run(run.id).await.unwrap();
        let orchestrator = conversations
            .iter()
            .find(|c| c.agent == AgentRole::Orchestrator)
            .unwrap();
        let messages = ledger
            .messages(orchestrator.id, Default::default())
            .await
            .unwrap();
        assert!(messages.last().unwrap().metadata.is_terminal);
    }

    #[tokio::test]
    async fn test_resume_between_tasks_keeps_earlier_escalations() {
        let f = fixture().await;
        let recording = Arc::new(RecordingCheckpoints::new(f.checkpoints.clone()));
        let agents = Arc::new(FakeAgents {
            fail_task: Some("task-1"),
            ..FakeAgents::default()
        });
        let baseline = engine(&f, agents.clone(), recording.clone());
        let first = baseline.create_run("T-14").await.unwrap();
        baseline.run(first.id, false).await.unwrap();
        let expected = f.checkpoints.load(first.id).await.unwrap().unwrap();
        let expected_entry = &expected.step_log[PipelineStep::ExecuteTasks.index()];
        assert_eq!(expected_entry.escalations.len(), 1);

        // The checkpoint written after task-1 failed and before task-2 ran.
        let mut between = recording
            .saved()
            .into_iter()
            .find(|c| c.task_progress.len() == 1)
            .unwrap();
        assert_eq!(between.escalation_queue.len(), 1);
        assert!(between.step_mark.is_some());

        let engine = engine(&f, agents.clone(), f.checkpoints.clone());
        let second = engine.create_run("T-14").await.unwrap();
        between.run_id = second.id;
        f.checkpoints.save(&between).await.unwrap();

        let done = engine.run(second.id, true).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.error, f.runs.get(first.id).await.unwrap().unwrap().error);

        let actual = f.checkpoints.load(second.id).await.unwrap().unwrap();
        let entry = &actual.step_log[PipelineStep::ExecuteTasks.index()];
        assert_eq!(entry.status, expected_entry.status);
        assert_eq!(entry.error, expected_entry.error);
        assert_eq!(entry.escalations.len(), 1);
        assert_eq!(entry.escalations[0].id, between.escalation_queue[0].id);
        assert_eq!(entry.escalations[0].status, HandoffStatus::Completed);
        assert!(actual.step_mark.is_none());
    }
}
