//! Pipeline steps, agent roles and the step log.
//!
//! Each step stores a typed payload in its log entry. The payload enum is
//! keyed by step so resumed runs can rebuild their context from the log
//! without reinterpreting loosely-typed maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::collaborator::{CheckRun, FileChange, PullRequest};
use super::handoff::{Collaboration, CollaborationType, Escalation};

/// Agent roles participating in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Architect,
    Implementer,
    Tester,
    Reviewer,
    /// The engine itself, for records no agent owns.
    Orchestrator,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Architect => "architect",
            Self::Implementer => "implementer",
            Self::Tester => "tester",
            Self::Reviewer => "reviewer",
            Self::Orchestrator => "orchestrator",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "planner" => Some(Self::Planner),
            "architect" => Some(Self::Architect),
            "implementer" => Some(Self::Implementer),
            "tester" => Some(Self::Tester),
            "reviewer" => Some(Self::Reviewer),
            "orchestrator" => Some(Self::Orchestrator),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed, ordered pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    RetrieveTicket,
    IndexCodebase,
    GeneratePlan,
    BreakDownTasks,
    DrainCollaborations,
    ExecuteTasks,
    FinalReview,
}

impl PipelineStep {
    /// All steps in execution order.
    pub const ALL: [PipelineStep; 7] = [
        Self::RetrieveTicket,
        Self::IndexCodebase,
        Self::GeneratePlan,
        Self::BreakDownTasks,
        Self::DrainCollaborations,
        Self::ExecuteTasks,
        Self::FinalReview,
    ];

    pub fn index(&self) -> usize {
        Self::ALL
            .iter()
            .position(|s| s == self)
            .unwrap_or(Self::ALL.len())
    }

    pub fn next(&self) -> Option<PipelineStep> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Role responsible for the step.
    pub fn agent(&self) -> AgentRole {
        match self {
            Self::RetrieveTicket | Self::BreakDownTasks => AgentRole::Planner,
            Self::IndexCodebase | Self::GeneratePlan => AgentRole::Architect,
            Self::DrainCollaborations => AgentRole::Orchestrator,
            Self::ExecuteTasks => AgentRole::Implementer,
            Self::FinalReview => AgentRole::Reviewer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetrieveTicket => "retrieve_ticket",
            Self::IndexCodebase => "index_codebase",
            Self::GeneratePlan => "generate_plan",
            Self::BreakDownTasks => "break_down_tasks",
            Self::DrainCollaborations => "drain_collaborations",
            Self::ExecuteTasks => "execute_tasks",
            Self::FinalReview => "final_review",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|step| step.as_str() == s)
    }
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// Planner's reading of the ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketAnalysis {
    pub ticket_id: String,
    pub title: String,
    pub summary: String,
    /// Whether the ticket content was a placeholder.
    #[serde(default)]
    pub placeholder: bool,
}

/// Architect's summary of the workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodebaseIndex {
    pub root: Option<String>,
    pub file_count: usize,
    /// File counts keyed by extension (`""` for files without one).
    pub extensions: BTreeMap<String, usize>,
    /// Sample of indexed paths, relative to the root.
    pub sample_paths: Vec<String>,
}

/// Architect's implementation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationPlan {
    pub summary: String,
    pub content: String,
}

/// One unit of implementation work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTask {
    /// Stable identifier within the run, e.g. `task-1`.
    pub id: String,
    pub title: String,
    /// Artifact the task needs from another role, if any.
    #[serde(default)]
    pub needs: Option<CollaborationType>,
}

/// Planner's task breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBreakdown {
    pub tasks: Vec<PlannedTask>,
}

/// Counts from draining the handoff queues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainSummary {
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcomeStatus {
    Completed,
    Failed,
}

/// Result of executing one planned task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub title: String,
    pub status: TaskOutcomeStatus,
    #[serde(default)]
    pub artifact: Option<FileChange>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Results of the execute-tasks step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub outcomes: Vec<TaskOutcome>,
}

impl ExecutionSummary {
    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == TaskOutcomeStatus::Failed)
            .count()
    }

    pub fn artifacts(&self) -> Vec<FileChange> {
        self.outcomes
            .iter()
            .filter_map(|o| o.artifact.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved,
    ChangesRequested,
}

/// Reviewer and tester output plus the pull request outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub verdict: ReviewVerdict,
    pub summary: String,
    pub test_report: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub pull_request: Option<PullRequest>,
    #[serde(default)]
    pub check_runs: Vec<CheckRun>,
    /// Recorded, non-fatal source-control failure.
    #[serde(default)]
    pub source_control_error: Option<String>,
}

/// Typed payload of a step-log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepPayload {
    TicketAnalyzed(TicketAnalysis),
    CodebaseIndexed(CodebaseIndex),
    PlanGenerated(ImplementationPlan),
    TasksBrokenDown(TaskBreakdown),
    CollaborationsDrained(DrainSummary),
    TasksExecuted(ExecutionSummary),
    ReviewCompleted(ReviewOutcome),
}

/// One executed pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLogEntry {
    pub step: PipelineStep,
    pub agent: AgentRole,
    pub status: StepStatus,
    #[serde(default)]
    pub detail: Option<StepPayload>,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub escalations: Vec<Escalation>,
    #[serde(default)]
    pub collaborations: Vec<Collaboration>,
}

impl StepLogEntry {
    pub fn completed(step: PipelineStep, detail: StepPayload) -> Self {
        Self {
            step,
            agent: step.agent(),
            status: StepStatus::Completed,
            detail: Some(detail),
            error: None,
            timestamp: Utc::now(),
            escalations: Vec::new(),
            collaborations: Vec::new(),
        }
    }

    pub fn failed(step: PipelineStep, error: impl Into<String>) -> Self {
        Self {
            step,
            agent: step.agent(),
            status: StepStatus::Failed,
            detail: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
            escalations: Vec::new(),
            collaborations: Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// Typed lookups over an ordered step log.
pub trait StepLogExt {
    fn payload(&self, step: PipelineStep) -> Option<&StepPayload>;
    fn ticket_analysis(&self) -> Option<&TicketAnalysis>;
    fn codebase_index(&self) -> Option<&CodebaseIndex>;
    fn plan(&self) -> Option<&ImplementationPlan>;
    fn breakdown(&self) -> Option<&TaskBreakdown>;
    fn execution(&self) -> Option<&ExecutionSummary>;
    fn last_error(&self) -> Option<&str>;
}

impl StepLogExt for [StepLogEntry] {
    fn payload(&self, step: PipelineStep) -> Option<&StepPayload> {
        self.iter()
            .rev()
            .find(|e| e.step == step)
            .and_then(|e| e.detail.as_ref())
    }

    fn ticket_analysis(&self) -> Option<&TicketAnalysis> {
        match self.payload(PipelineStep::RetrieveTicket) {
            Some(StepPayload::TicketAnalyzed(a)) => Some(a),
            _ => None,
        }
    }

    fn codebase_index(&self) -> Option<&CodebaseIndex> {
        match self.payload(PipelineStep::IndexCodebase) {
            Some(StepPayload::CodebaseIndexed(i)) => Some(i),
            _ => None,
        }
    }

    fn plan(&self) -> Option<&ImplementationPlan> {
        match self.payload(PipelineStep::GeneratePlan) {
            Some(StepPayload::PlanGenerated(p)) => Some(p),
            _ => None,
        }
    }

    fn breakdown(&self) -> Option<&TaskBreakdown> {
        match self.payload(PipelineStep::BreakDownTasks) {
            Some(StepPayload::TasksBrokenDown(b)) => Some(b),
            _ => None,
        }
    }

    fn execution(&self) -> Option<&ExecutionSummary> {
        match self.payload(PipelineStep::ExecuteTasks) {
            Some(StepPayload::TasksExecuted(s)) => Some(s),
            _ => None,
        }
    }

    fn last_error(&self) -> Option<&str> {
        self.iter().rev().find_map(|e| e.error.as_deref())
    }
}
