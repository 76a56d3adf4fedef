//! Durable snapshot of a run's progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::handoff::{Collaboration, Escalation, HandoffMark};
use super::pipeline::{StepLogEntry, TaskOutcome};

/// Persisted run progress, written after every step and every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub step_log: Vec<StepLogEntry>,
    #[serde(default)]
    pub collaboration_queue: Vec<Collaboration>,
    #[serde(default)]
    pub escalation_queue: Vec<Escalation>,
    pub timestamp: DateTime<Utc>,
    /// Outcomes of already-executed tasks, keyed by task id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub task_progress: BTreeMap<String, TaskOutcome>,
    /// Queue positions when the step in progress started. Only present in
    /// checkpoints written in the middle of a step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_mark: Option<HandoffMark>,
}

impl Checkpoint {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            step_log: Vec::new(),
            collaboration_queue: Vec::new(),
            escalation_queue: Vec::new(),
            timestamp: Utc::now(),
            task_progress: BTreeMap::new(),
            step_mark: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{PipelineStep, StepPayload, TicketAnalysis};

    #[test]
    fn test_wire_format_uses_camel_case() {
        let mut checkpoint = Checkpoint::new(Uuid::new_v4());
        checkpoint.step_log.push(StepLogEntry::completed(
            PipelineStep::RetrieveTicket,
            StepPayload::TicketAnalyzed(TicketAnalysis {
                ticket_id: "T-1".to_string(),
                title: "Add login".to_string(),
                summary: "Add a login endpoint".to_string(),
                placeholder: false,
            }),
        ));

        let json = serde_json::to_value(&checkpoint).unwrap();
        assert!(json.get("runId").is_some());
        assert!(json.get("stepLog").is_some());
        assert!(json.get("collaborationQueue").is_some());
        assert!(json.get("escalationQueue").is_some());
        assert!(json.get("taskProgress").is_none());
        assert!(json.get("stepMark").is_none());

        let back: Checkpoint = serde_json::from_value(json).unwrap();
        assert_eq!(back, checkpoint);
    }

    #[test]
    fn test_mid_step_mark_survives_serialization() {
        let mut checkpoint = Checkpoint::new(Uuid::new_v4());
        checkpoint.step_mark = Some(HandoffMark {
            escalations: 2,
            collaborations: 1,
        });

        let json = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(json["stepMark"]["escalations"], 2);

        let back: Checkpoint = serde_json::from_value(json).unwrap();
        assert_eq!(back.step_mark, checkpoint.step_mark);
    }
}
