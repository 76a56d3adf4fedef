pub mod checkpoint;
pub mod collaborator;
pub mod config;
pub mod conversation;
pub mod deployment;
pub mod handoff;
pub mod pipeline;
pub mod prompt;
pub mod run;

pub use checkpoint::Checkpoint;
pub use collaborator::{CheckRun, FileChange, PullRequest, Ticket};
pub use config::{
    CheckpointConfig, CompletionConfig, Config, DatabaseConfig, DispatcherConfig, GithubConfig,
    GovernorConfig, HeartbeatConfig, LoggingConfig, RateLimitConfig, RetryConfig, WorkspaceConfig,
};
pub use conversation::{
    AgentCallRecord, CallFilter, CallStatus, CompletionCall, Conversation, Message,
    MessageMetadata, MessageRole, NewCompletionCall, Page, TerminalContext,
};
pub use deployment::{Deployment, DeploymentState};
pub use handoff::{
    Collaboration, CollaborationType, Escalation, EscalationPriority, HandoffMark, HandoffRecord,
    HandoffStatus,
};
pub use pipeline::{
    AgentRole, CodebaseIndex, DrainSummary, ExecutionSummary, ImplementationPlan, PipelineStep,
    PlannedTask, ReviewOutcome, ReviewVerdict, StepLogEntry, StepLogExt, StepPayload, StepStatus,
    TaskBreakdown, TaskOutcome, TaskOutcomeStatus, TicketAnalysis,
};
pub use prompt::{estimate_tokens, BudgetSnapshot, Prompt, PromptSection, TruncatedSection};
pub use run::{Run, RunFilter, RunStatus};
