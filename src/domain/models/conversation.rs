//! Conversation ledger records: conversations, messages and completion calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::pipeline::{AgentRole, PipelineStep};
use super::prompt::{BudgetSnapshot, TruncatedSection};
use crate::domain::errors::TokenMath;

/// Exchange between one agent and the model during one step of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub run_id: Uuid,
    pub agent: AgentRole,
    pub step: PipelineStep,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// Metadata stored alongside each message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub agent: Option<AgentRole>,
    #[serde(default)]
    pub step: Option<PipelineStep>,
    #[serde(default)]
    pub attempt: Option<u32>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub is_terminal: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MessageMetadata {
    pub fn for_step(agent: AgentRole, step: PipelineStep) -> Self {
        Self {
            agent: Some(agent),
            step: Some(step),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// One append-only entry in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Insertion order within the conversation, starting at 1.
    pub sequence: i64,
    pub role: MessageRole,
    pub content: String,
    pub artifacts: Vec<String>,
    pub metadata: MessageMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Failed,
    Truncated,
    /// Rejected by the governor before reaching a deployment.
    Skipped,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Truncated => "truncated",
            Self::Skipped => "skipped",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "truncated" => Some(Self::Truncated),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Audit row for one logical completion call. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionCall {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Deployment used by the final attempt.
    pub deployment: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub requested_max_tokens: i64,
    pub latency_ms: i64,
    pub status: CallStatus,
    pub error_code: Option<String>,
    pub truncated_sections: Vec<String>,
    pub prompt_hash: String,
    pub response_hash: Option<String>,
    pub budget: BudgetSnapshot,
    pub cost: f64,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Input for recording a completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCompletionCall {
    pub conversation_id: Uuid,
    pub deployment: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub requested_max_tokens: i64,
    pub latency_ms: i64,
    pub status: CallStatus,
    pub error_code: Option<String>,
    pub truncated_sections: Vec<String>,
    pub prompt_hash: String,
    pub response_hash: Option<String>,
    pub budget: BudgetSnapshot,
    pub cost: f64,
    pub attempts: u32,
}

impl NewCompletionCall {
    /// Materialize the stored record.
    pub fn into_call(self) -> CompletionCall {
        CompletionCall {
            id: Uuid::new_v4(),
            conversation_id: self.conversation_id,
            deployment: self.deployment,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.prompt_tokens + self.completion_tokens,
            requested_max_tokens: self.requested_max_tokens,
            latency_ms: self.latency_ms,
            status: self.status,
            error_code: self.error_code,
            truncated_sections: self.truncated_sections,
            prompt_hash: self.prompt_hash,
            response_hash: self.response_hash,
            budget: self.budget,
            cost: self.cost,
            attempts: self.attempts,
            created_at: Utc::now(),
        }
    }
}

/// Compact per-agent history row appended with every completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCallRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub agent: AgentRole,
    pub step: PipelineStep,
    pub call_id: Uuid,
    pub status: CallStatus,
    pub total_tokens: i64,
    pub created_at: DateTime<Utc>,
}

/// Filter for listing completion calls.
#[derive(Debug, Clone, Default)]
pub struct CallFilter {
    pub run_id: Option<Uuid>,
    pub agent: Option<AgentRole>,
    pub step: Option<PipelineStep>,
    pub status: Option<CallStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Limit/offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Facts summarized into a conversation's terminal message.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalContext {
    pub run_id: Uuid,
    pub error: String,
    pub error_code: Option<String>,
    pub math: Option<TokenMath>,
    pub truncated_sections: Vec<TruncatedSection>,
}

impl TerminalContext {
    pub fn new(run_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            run_id,
            error: error.into(),
            error_code: None,
            math: None,
            truncated_sections: Vec::new(),
        }
    }

    pub fn from_governance(run_id: Uuid, err: &crate::domain::errors::GovernanceError) -> Self {
        Self {
            run_id,
            error: err.to_string(),
            error_code: Some(err.code().to_string()),
            math: Some(err.math().clone()),
            truncated_sections: err.truncated_sections().to_vec(),
        }
    }

    /// Render the terminal message body.
    pub fn render(&self) -> String {
        let mut out = format!("Run stopped: {}\n", self.error);
        if let Some(code) = &self.error_code {
            out.push_str(&format!("Error code: {code}\n"));
        }
        if let Some(math) = &self.math {
            out.push_str(&format!("Token math: {math}\n"));
        }
        if !self.truncated_sections.is_empty() {
            out.push_str("Truncated sections:\n");
            for section in &self.truncated_sections {
                out.push_str(&format!(
                    "  - {} ({} -> {} tokens)\n",
                    section.tag, section.original_tokens, section.kept_tokens
                ));
            }
        }
        out.push_str(&format!(
            "Resume with `foreman resume {}` after addressing the cause.",
            self.run_id
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_call_totals_tokens() {
        let call = NewCompletionCall {
            conversation_id: Uuid::new_v4(),
            deployment: "gpt-a".to_string(),
            prompt_tokens: 120,
            completion_tokens: 30,
            requested_max_tokens: 500,
            latency_ms: 12,
            status: CallStatus::Success,
            error_code: None,
            truncated_sections: vec![],
            prompt_hash: "abc".to_string(),
            response_hash: Some("def".to_string()),
            budget: BudgetSnapshot::default(),
            cost: 0.01,
            attempts: 1,
        }
        .into_call();
        assert_eq!(call.total_tokens, 150);
    }

    #[test]
    fn test_terminal_render_includes_math_and_hint() {
        let run_id = Uuid::new_v4();
        let ctx = TerminalContext {
            run_id,
            error: "context exhausted".to_string(),
            error_code: Some("token_governance".to_string()),
            math: Some(TokenMath {
                context_window: 4_000,
                prompt_tokens: 3_900,
                safety_buffer: 200,
                available_tokens: -100,
                prompt_ceiling: 20_000,
                requested_max_tokens: 800,
            }),
            truncated_sections: vec![TruncatedSection {
                tag: "codebase".to_string(),
                original_tokens: 3_000,
                kept_tokens: 400,
            }],
        };
        let text = ctx.render();
        assert!(text.contains("available=-100"));
        assert!(text.contains("codebase (3000 -> 400 tokens)"));
        assert!(text.contains(&format!("foreman resume {run_id}")));
    }

    #[test]
    fn test_metadata_extra_is_skipped_when_empty() {
        let meta = MessageMetadata::for_step(AgentRole::Planner, PipelineStep::RetrieveTicket);
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("extra").is_none());
        assert_eq!(json["agent"], "planner");
    }
}
