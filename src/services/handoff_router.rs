//! Escalation and collaboration queues for one run.
//!
//! Agents enqueue handoffs mid-step; the engine drains them before the
//! pipeline advances. Draining claims pending items (`pending → queued`)
//! while holding the queue lock, so two concurrent drains never hand the same
//! item to a handler. Every item ends `completed` or `failed` exactly once.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::models::{
    AgentRole, Collaboration, CollaborationType, DrainSummary, Escalation, EscalationPriority,
    HandoffMark, HandoffRecord, HandoffStatus,
};
use crate::services::event_bus::{EventBus, EventPayload, HandoffKind};

/// Handles escalations addressed to one role.
#[async_trait]
pub trait EscalationHandler: Send + Sync {
    async fn handle(&self, escalation: &Escalation) -> Result<serde_json::Value, String>;
}

/// Produces the artifact for one kind of collaboration.
#[async_trait]
pub trait CollaborationHandler: Send + Sync {
    async fn handle(&self, collaboration: &Collaboration) -> Result<serde_json::Value, String>;
}

/// Items resolved by one drain.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub escalations: Vec<Escalation>,
    pub collaborations: Vec<Collaboration>,
}

impl DrainReport {
    pub fn completed(&self) -> usize {
        self.escalations
            .iter()
            .map(|e| e.status)
            .chain(self.collaborations.iter().map(|c| c.status))
            .filter(|s| *s == HandoffStatus::Completed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.escalations
            .iter()
            .map(|e| e.status)
            .chain(self.collaborations.iter().map(|c| c.status))
            .filter(|s| *s == HandoffStatus::Failed)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.escalations.is_empty() && self.collaborations.is_empty()
    }

    pub fn summary(&self) -> DrainSummary {
        DrainSummary {
            completed: self.completed(),
            failed: self.failed(),
        }
    }

    fn merge(&mut self, other: DrainReport) {
        self.escalations.extend(other.escalations);
        self.collaborations.extend(other.collaborations);
    }
}

/// Move every pending item to queued and return copies of them.
fn claim_pending<T: HandoffRecord>(queue: &mut [T]) -> Vec<T> {
    queue
        .iter_mut()
        .filter(|item| item.status() == HandoffStatus::Pending)
        .map(|item| {
            item.set_status(HandoffStatus::Queued);
            item.clone()
        })
        .collect()
}

fn store_resolved<T: HandoffRecord>(queue: &mut [T], resolved: &T) {
    if let Some(slot) = queue.iter_mut().find(|item| item.id() == resolved.id()) {
        *slot = resolved.clone();
    }
}

pub struct HandoffRouter {
    run_id: Uuid,
    event_bus: Arc<EventBus>,
    escalations: Mutex<Vec<Escalation>>,
    collaborations: Mutex<Vec<Collaboration>>,
    escalation_handlers: HashMap<AgentRole, Arc<dyn EscalationHandler>>,
    collaboration_handlers: HashMap<CollaborationType, Arc<dyn CollaborationHandler>>,
}

impl HandoffRouter {
    pub fn new(run_id: Uuid, event_bus: Arc<EventBus>) -> Self {
        Self {
            run_id,
            event_bus,
            escalations: Mutex::new(Vec::new()),
            collaborations: Mutex::new(Vec::new()),
            escalation_handlers: HashMap::new(),
            collaboration_handlers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_escalation_handler(
        mut self,
        role: AgentRole,
        handler: Arc<dyn EscalationHandler>,
    ) -> Self {
        self.escalation_handlers.insert(role, handler);
        self
    }

    #[must_use]
    pub fn with_collaboration_handler(
        mut self,
        kind: CollaborationType,
        handler: Arc<dyn CollaborationHandler>,
    ) -> Self {
        self.collaboration_handlers.insert(kind, handler);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn escalate(
        &self,
        from: AgentRole,
        to: AgentRole,
        reason: impl Into<String>,
        context: serde_json::Value,
        priority: EscalationPriority,
    ) -> Escalation {
        let escalation = Escalation {
            id: Uuid::new_v4(),
            run_id: self.run_id,
            from,
            to,
            reason: reason.into(),
            context,
            priority,
            status: HandoffStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.escalations.lock().await.push(escalation.clone());
        tracing::info!(run_id = %self.run_id, %from, %to, reason = %escalation.reason, "escalation queued");
        self.event_bus.publish(EventPayload::HandoffQueued {
            run_id: self.run_id,
            kind: HandoffKind::Escalation,
            handoff_id: escalation.id,
            to,
        });
        escalation
    }

    pub async fn request_collaboration(
        &self,
        from: AgentRole,
        to: AgentRole,
        kind: CollaborationType,
        data: serde_json::Value,
    ) -> Collaboration {
        let collaboration = Collaboration {
            id: Uuid::new_v4(),
            run_id: self.run_id,
            from,
            to,
            kind,
            data,
            status: HandoffStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.collaborations.lock().await.push(collaboration.clone());
        tracing::info!(run_id = %self.run_id, %from, %to, %kind, "collaboration requested");
        self.event_bus.publish(EventPayload::HandoffQueued {
            run_id: self.run_id,
            kind: HandoffKind::Collaboration,
            handoff_id: collaboration.id,
            to,
        });
        collaboration
    }

    fn publish_resolved(&self, kind: HandoffKind, id: Uuid, status: HandoffStatus) {
        self.event_bus.publish(EventPayload::HandoffResolved {
            run_id: self.run_id,
            kind,
            handoff_id: id,
            status,
        });
    }

    /// Resolve every pending escalation and collaboration.
    ///
    /// Handlers may enqueue further handoffs; those are drained in the same
    /// call.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            let round = self.drain_once().await;
            if round.is_empty() {
                break;
            }
            report.merge(round);
        }
        if !report.is_empty() {
            tracing::debug!(
                run_id = %self.run_id,
                completed = report.completed(),
                failed = report.failed(),
                "handoff queues drained"
            );
        }
        report
    }

    async fn drain_once(&self) -> DrainReport {
        let mut report = DrainReport::default();

        let claimed = claim_pending(&mut self.escalations.lock().await);
        for mut escalation in claimed {
            let outcome = match self.escalation_handlers.get(&escalation.to) {
                Some(handler) => handler.handle(&escalation).await,
                None => Err(format!("no escalation handler for role {}", escalation.to)),
            };
            escalation.resolve(outcome);
            store_resolved(&mut self.escalations.lock().await, &escalation);
            self.publish_resolved(HandoffKind::Escalation, escalation.id, escalation.status);
            report.escalations.push(escalation);
        }

        let claimed = claim_pending(&mut self.collaborations.lock().await);
        for mut collaboration in claimed {
            let outcome = match self.collaboration_handlers.get(&collaboration.kind) {
                Some(handler) => handler.handle(&collaboration).await,
                None => Err(format!(
                    "no collaboration handler for {}",
                    collaboration.kind
                )),
            };
            collaboration.resolve(outcome);
            store_resolved(&mut self.collaborations.lock().await, &collaboration);
            self.publish_resolved(
                HandoffKind::Collaboration,
                collaboration.id,
                collaboration.status,
            );
            report.collaborations.push(collaboration);
        }

        report
    }

    /// Fail every item that is not yet terminal.
    pub async fn fail_unresolved(&self, reason: &str) -> usize {
        let mut failed = Vec::new();
        for escalation in self.escalations.lock().await.iter_mut() {
            if !escalation.status.is_terminal() {
                escalation.resolve(Err(reason.to_string()));
                failed.push((HandoffKind::Escalation, escalation.id));
            }
        }
        for collaboration in self.collaborations.lock().await.iter_mut() {
            if !collaboration.status.is_terminal() {
                collaboration.resolve(Err(reason.to_string()));
                failed.push((HandoffKind::Collaboration, collaboration.id));
            }
        }
        for (kind, id) in &failed {
            self.publish_resolved(*kind, *id, HandoffStatus::Failed);
        }
        failed.len()
    }

    pub async fn pending_count(&self) -> usize {
        let escalations = self
            .escalations
            .lock()
            .await
            .iter()
            .filter(|e| !e.status.is_terminal())
            .count();
        let collaborations = self
            .collaborations
            .lock()
            .await
            .iter()
            .filter(|c| !c.status.is_terminal())
            .count();
        escalations + collaborations
    }

    pub async fn mark(&self) -> HandoffMark {
        HandoffMark {
            escalations: self.escalations.lock().await.len(),
            collaborations: self.collaborations.lock().await.len(),
        }
    }

    /// Current state of the handoffs raised after `mark`.
    pub async fn since(&self, mark: HandoffMark) -> (Vec<Escalation>, Vec<Collaboration>) {
        let escalations = self
            .escalations
            .lock()
            .await
            .iter()
            .skip(mark.escalations)
            .cloned()
            .collect();
        let collaborations = self
            .collaborations
            .lock()
            .await
            .iter()
            .skip(mark.collaborations)
            .cloned()
            .collect();
        (escalations, collaborations)
    }

    /// Copies of both queues, for checkpointing.
    pub async fn snapshot(&self) -> (Vec<Collaboration>, Vec<Escalation>) {
        (
            self.collaborations.lock().await.clone(),
            self.escalations.lock().await.clone(),
        )
    }

    /// Replace both queues with checkpointed contents.
    ///
    /// Items that were claimed but never resolved go back to pending.
    pub async fn restore(&self, collaborations: Vec<Collaboration>, escalations: Vec<Escalation>) {
        fn requeue<T: HandoffRecord>(mut items: Vec<T>) -> Vec<T> {
            for item in &mut items {
                if item.status() == HandoffStatus::Queued {
                    item.set_status(HandoffStatus::Pending);
                }
            }
            items
        }
        *self.collaborations.lock().await = requeue(collaborations);
        *self.escalations.lock().await = requeue(escalations);
    }
}
