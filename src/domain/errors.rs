//! Domain errors for the Foreman pipeline.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::{RunStatus, TruncatedSection};

/// Token arithmetic captured at the moment a request was governed.
///
/// Carried by governance failures so the terminal ledger message can show
/// exactly why the request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenMath {
    pub context_window: usize,
    pub prompt_tokens: usize,
    pub safety_buffer: usize,
    pub available_tokens: i64,
    pub prompt_ceiling: usize,
    pub requested_max_tokens: usize,
}

impl std::fmt::Display for TokenMath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "context_window={} prompt_tokens={} safety_buffer={} available={} ceiling={} requested_max={}",
            self.context_window,
            self.prompt_tokens,
            self.safety_buffer,
            self.available_tokens,
            self.prompt_ceiling,
            self.requested_max_tokens
        )
    }
}

/// Rejections produced by the token governor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GovernanceError {
    #[error("Prompt too large: {} tokens exceeds the per-step ceiling of {}", .math.prompt_tokens, .math.prompt_ceiling)]
    PromptTooLarge { math: TokenMath },

    #[error("Token governance failed after {attempts} shrink attempt(s): {math}")]
    ContextExhausted {
        math: TokenMath,
        attempts: u32,
        truncated_sections: Vec<TruncatedSection>,
    },
}

impl GovernanceError {
    /// Token math at the point of rejection.
    pub fn math(&self) -> &TokenMath {
        match self {
            Self::PromptTooLarge { math } | Self::ContextExhausted { math, .. } => math,
        }
    }

    /// Sections truncated before the request was given up on.
    pub fn truncated_sections(&self) -> &[TruncatedSection] {
        match self {
            Self::PromptTooLarge { .. } => &[],
            Self::ContextExhausted {
                truncated_sections, ..
            } => truncated_sections,
        }
    }

    /// Short machine-readable code stored on skipped completion calls.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PromptTooLarge { .. } => "prompt_too_large",
            Self::ContextExhausted { .. } => "token_governance",
        }
    }
}

/// Domain-level errors that can occur in the Foreman pipeline.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(Uuid),

    #[error("Invalid status transition for run {run_id} from {from} to {to}")]
    InvalidStatusTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The datastore reported a lock or busy condition; safe to retry.
    #[error("Datastore contention: {0}")]
    Contention(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    Governance(#[from] GovernanceError),

    #[error("Completion failed on deployment {deployment}: {message}")]
    CompletionFailed { deployment: String, message: String },

    #[error("Completion retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("External collaborator error ({collaborator}): {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Heartbeat timeout for run {run_id}: {detail}")]
    HeartbeatTimeout { run_id: Uuid, detail: String },

    #[error("Handoff error: {0}")]
    Handoff(String),
}

impl DomainError {
    /// Whether the error is transient and the operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Contention(_))
    }

    /// Convenience constructor for collaborator failures.
    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            message: message.into(),
        }
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

/// SQLite primary result codes that indicate lock contention.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

fn is_lock_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let by_code = db
                .code()
                .and_then(|c| c.parse::<i64>().ok())
                .is_some_and(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED));
            by_code || db.message().contains("database is locked")
        }
        _ => false,
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        if is_lock_error(&err) {
            DomainError::Contention(err.to_string())
        } else {
            DomainError::DatabaseError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}
