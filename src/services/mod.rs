//! Orchestration services.
//!
//! Each service owns one concern of a delivery run and talks to storage and
//! model endpoints only through the domain ports.

pub mod completion_service;
pub mod conversation_ledger;
pub mod deployment_dispatcher;
pub mod event_bus;
pub mod handoff_router;
pub mod heartbeat_monitor;
pub mod pipeline_agents;
pub mod status_finalizer;
pub mod token_governor;
pub mod workflow_engine;

pub use completion_service::{CompletionOutcome, CompletionRequest, CompletionService};
pub use conversation_ledger::ConversationLedger;
pub use deployment_dispatcher::{DeploymentDispatcher, RateLimitRegistry};
pub use event_bus::{EventBus, EventPayload, HandoffKind, UnifiedEvent};
pub use handoff_router::{CollaborationHandler, DrainReport, EscalationHandler, HandoffRouter};
pub use heartbeat_monitor::{AuditHandle, HeartbeatHandle, HeartbeatMonitor};
pub use pipeline_agents::{
    AgentCollaborationHandler, AgentEscalationHandler, LlmPipelineAgents, PipelineAgents,
    StepContext,
};
pub use status_finalizer::{FinalizeOutcome, StatusFinalizer};
pub use token_governor::{Admission, TokenGovernor};
pub use workflow_engine::WorkflowEngine;
