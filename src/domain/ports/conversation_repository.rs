//! Conversation ledger repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    AgentCallRecord, AgentRole, CallFilter, CompletionCall, Conversation, Message,
    MessageMetadata, MessageRole, Page, PipelineStep,
};

/// Repository interface for conversations, messages and completion calls.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Return the conversation for `(run, agent, step)`, creating it if needed.
    async fn get_or_create(
        &self,
        run_id: Uuid,
        agent: AgentRole,
        step: PipelineStep,
    ) -> DomainResult<Conversation>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Conversation>>;

    async fn list_for_run(&self, run_id: Uuid) -> DomainResult<Vec<Conversation>>;

    /// Append a message, assigning the next sequence number.
    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        artifacts: &[String],
        metadata: &MessageMetadata,
    ) -> DomainResult<Message>;

    /// Messages in sequence order.
    async fn list_messages(&self, conversation_id: Uuid, page: Page) -> DomainResult<Vec<Message>>;

    /// Store a call, bump the conversation aggregates and append the agent
    /// history row in one transaction.
    async fn record_call(&self, call: &CompletionCall, record: &AgentCallRecord)
        -> DomainResult<()>;

    async fn list_calls(&self, filter: CallFilter) -> DomainResult<Vec<CompletionCall>>;

    async fn call_history(
        &self,
        run_id: Uuid,
        agent: Option<AgentRole>,
    ) -> DomainResult<Vec<AgentCallRecord>>;
}
