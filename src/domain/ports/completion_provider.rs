//! Completion provider port - interface for model endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::domain::models::MessageRole;

/// One chat message sent to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// A successful completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResponse {
    pub content: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

/// Provider failures, classified for the call loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    /// The deployment is rate limited; try another one.
    #[error("Deployment throttled (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    #[error("Transient provider failure: {0}")]
    Transient(String),

    #[error("Provider failure: {0}")]
    Fatal(String),
}

impl CompletionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Throttled { .. } => "throttled",
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "provider_error",
        }
    }
}

/// Trait for completion endpoint implementations.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Request a completion from one deployment.
    async fn complete(
        &self,
        deployment: &str,
        messages: &[ChatMessage],
        max_tokens: usize,
    ) -> Result<CompletionResponse, CompletionError>;
}
