//! Escalation and collaboration records exchanged between agent roles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pipeline::AgentRole;

/// Status of a handoff request.
///
/// ```text
/// Pending → Queued → Completed | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Queued,
    Completed,
    Failed,
}

impl HandoffStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Priority of an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// Artifact a collaboration asks the target role to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationType {
    InterfaceContract,
    UiSpecification,
    DataModelSpecification,
}

impl CollaborationType {
    /// Role that produces this kind of artifact.
    pub fn default_target(&self) -> AgentRole {
        match self {
            Self::InterfaceContract => AgentRole::Implementer,
            Self::UiSpecification | Self::DataModelSpecification => AgentRole::Architect,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InterfaceContract => "interface_contract",
            Self::UiSpecification => "ui_specification",
            Self::DataModelSpecification => "data_model_specification",
        }
    }
}

impl std::fmt::Display for CollaborationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request for another role to take over or advise on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub run_id: Uuid,
    pub from: AgentRole,
    pub to: AgentRole,
    pub reason: String,
    #[serde(default)]
    pub context: serde_json::Value,
    pub priority: EscalationPriority,
    pub status: HandoffStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Request for another role to produce an artifact the requester needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collaboration {
    pub id: Uuid,
    pub run_id: Uuid,
    pub from: AgentRole,
    pub to: AgentRole,
    pub kind: CollaborationType,
    #[serde(default)]
    pub data: serde_json::Value,
    pub status: HandoffStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Queue positions, used to collect the handoffs raised after a point.
///
/// Queues only grow, so a mark taken before a step stays valid across a
/// checkpoint and restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffMark {
    pub escalations: usize,
    pub collaborations: usize,
}

/// Common view over escalations and collaborations used by the router queue.
pub trait HandoffRecord: Clone + Send + Sync + 'static {
    fn id(&self) -> Uuid;
    fn status(&self) -> HandoffStatus;
    fn set_status(&mut self, status: HandoffStatus);
    /// Record the terminal outcome. Callers guarantee this happens once.
    fn resolve(&mut self, outcome: Result<serde_json::Value, String>);
}

macro_rules! impl_handoff_record {
    ($ty:ty) => {
        impl HandoffRecord for $ty {
            fn id(&self) -> Uuid {
                self.id
            }

            fn status(&self) -> HandoffStatus {
                self.status
            }

            fn set_status(&mut self, status: HandoffStatus) {
                self.status = status;
            }

            fn resolve(&mut self, outcome: Result<serde_json::Value, String>) {
                match outcome {
                    Ok(value) => {
                        self.status = HandoffStatus::Completed;
                        self.result = Some(value);
                    }
                    Err(error) => {
                        self.status = HandoffStatus::Failed;
                        self.error = Some(error);
                    }
                }
                self.resolved_at = Some(Utc::now());
            }
        }
    };
}

impl_handoff_record!(Escalation);
impl_handoff_record!(Collaboration);
