//! EventBus service for live event streaming.
//!
//! A broadcast channel with sequence numbering. Durable writes publish the
//! exact record they stored, so a subscriber sees the same data a later read
//! of the ledger would return. Events are best-effort: publishing with no
//! subscribers is not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::models::{
    AgentCallRecord, AgentRole, CompletionCall, Conversation, DeploymentState, HandoffStatus,
    Message, Run, RunStatus, StepLogEntry,
};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonically increasing sequence number assigned by EventBus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

/// Event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Event category for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Run,
    Step,
    Ledger,
    Dispatcher,
    Heartbeat,
    Handoff,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Step => "step",
            Self::Ledger => "ledger",
            Self::Dispatcher => "dispatcher",
            Self::Heartbeat => "heartbeat",
            Self::Handoff => "handoff",
        }
    }
}

/// Event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedEvent {
    pub id: EventId,
    pub sequence: SequenceNumber,
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    pub category: EventCategory,
    pub run_id: Option<Uuid>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffKind {
    Escalation,
    Collaboration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    RunCreated {
        run: Run,
    },
    RunStarted {
        run_id: Uuid,
    },
    RunFinalized {
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
    },
    StepCompleted {
        run_id: Uuid,
        entry: StepLogEntry,
    },
    ConversationOpened {
        conversation: Conversation,
    },
    MessageAppended {
        run_id: Uuid,
        message: Message,
    },
    CompletionRecorded {
        run_id: Uuid,
        call: CompletionCall,
        record: AgentCallRecord,
    },
    DeploymentThrottled {
        state: DeploymentState,
    },
    HeartbeatTimedOut {
        run_id: Uuid,
        last_seen: Option<DateTime<Utc>>,
    },
    HandoffQueued {
        run_id: Uuid,
        kind: HandoffKind,
        handoff_id: Uuid,
        to: AgentRole,
    },
    HandoffResolved {
        run_id: Uuid,
        kind: HandoffKind,
        handoff_id: Uuid,
        status: HandoffStatus,
    },
}

impl EventPayload {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::RunCreated { .. } | Self::RunStarted { .. } | Self::RunFinalized { .. } => {
                EventCategory::Run
            }
            Self::StepCompleted { .. } => EventCategory::Step,
            Self::ConversationOpened { .. }
            | Self::MessageAppended { .. }
            | Self::CompletionRecorded { .. } => EventCategory::Ledger,
            Self::DeploymentThrottled { .. } => EventCategory::Dispatcher,
            Self::HeartbeatTimedOut { .. } => EventCategory::Heartbeat,
            Self::HandoffQueued { .. } | Self::HandoffResolved { .. } => EventCategory::Handoff,
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            Self::RunFinalized {
                status: RunStatus::Failed,
                ..
            }
            | Self::HeartbeatTimedOut { .. } => EventSeverity::Error,
            Self::DeploymentThrottled { .. }
            | Self::HandoffResolved {
                status: HandoffStatus::Failed,
                ..
            } => EventSeverity::Warning,
            Self::MessageAppended { .. } | Self::ConversationOpened { .. } => EventSeverity::Debug,
            _ => EventSeverity::Info,
        }
    }

    /// One-line human description.
    pub fn summary(&self) -> String {
        match self {
            Self::RunCreated { run } => format!("run created for {}", run.ticket_ref),
            Self::RunStarted { .. } => "run started".to_string(),
            Self::RunFinalized { status, error, .. } => match error {
                Some(error) => format!("run {status}: {error}"),
                None => format!("run {status}"),
            },
            Self::StepCompleted { entry, .. } => match &entry.error {
                Some(error) => format!("{} failed: {error}", entry.step),
                None => format!("{} completed by {}", entry.step, entry.agent),
            },
            Self::ConversationOpened { conversation } => {
                format!("{} conversation opened", conversation.agent)
            }
            Self::MessageAppended { message, .. } => {
                format!("message #{} ({})", message.sequence, message.role.as_str())
            }
            Self::CompletionRecorded { call, record, .. } => format!(
                "{} call on {} {} ({} tokens)",
                record.agent,
                call.deployment,
                call.status.as_str(),
                call.total_tokens
            ),
            Self::DeploymentThrottled { state } => format!(
                "{} throttled until {}",
                state.deployment,
                state.rate_limited_until.format("%H:%M:%S")
            ),
            Self::HeartbeatTimedOut { .. } => "heartbeat timed out".to_string(),
            Self::HandoffQueued { kind, to, .. } => format!("{kind:?} queued for {to}").to_lowercase(),
            Self::HandoffResolved { kind, status, .. } => {
                format!("{kind:?} {status:?}").to_lowercase()
            }
        }
    }

    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::RunCreated { run } => Some(run.id),
            Self::ConversationOpened { conversation } => Some(conversation.run_id),
            Self::DeploymentThrottled { .. } => None,
            Self::RunStarted { run_id }
            | Self::RunFinalized { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::MessageAppended { run_id, .. }
            | Self::CompletionRecorded { run_id, .. }
            | Self::HeartbeatTimedOut { run_id, .. }
            | Self::HandoffQueued { run_id, .. }
            | Self::HandoffResolved { run_id, .. } => Some(*run_id),
        }
    }
}

/// Configuration for the EventBus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Broadcast hub for pipeline events.
pub struct EventBus {
    sender: broadcast::Sender<UnifiedEvent>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Wrap a payload in an envelope and broadcast it.
    pub fn publish(&self, payload: EventPayload) -> SequenceNumber {
        let sequence = SequenceNumber(self.sequence.fetch_add(1, Ordering::SeqCst));
        let event = UnifiedEvent {
            id: EventId::new(),
            sequence,
            timestamp: Utc::now(),
            severity: payload.severity(),
            category: payload.category(),
            run_id: payload.run_id(),
            payload,
        };
        // No subscribers is fine.
        let _ = self.sender.send(event);
        sequence
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UnifiedEvent> {
        self.sender.subscribe()
    }

    pub fn current_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.sequence.load(Ordering::SeqCst))
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_assigns_increasing_sequence() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let run = Run::new("T-1");

        bus.publish(EventPayload::RunCreated { run: run.clone() });
        bus.publish(EventPayload::RunStarted { run_id: run.id });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.sequence < second.sequence);
        assert_eq!(first.run_id, Some(run.id));
        assert_eq!(first.category, EventCategory::Run);
        assert_eq!(bus.current_sequence(), SequenceNumber(2));
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(EventPayload::RunStarted {
            run_id: Uuid::new_v4(),
        });
    }

    #[test]
    fn test_failed_finalize_is_error_severity() {
        let payload = EventPayload::RunFinalized {
            run_id: Uuid::new_v4(),
            status: RunStatus::Failed,
            error: Some("heartbeat timeout".into()),
        };
        assert_eq!(payload.severity(), EventSeverity::Error);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "RunFinalized");
    }
}
