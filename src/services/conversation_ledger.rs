//! Durable record of every agent/model exchange.
//!
//! Writes are retried with bounded exponential backoff when the datastore
//! reports contention, so callers never observe a transient lock. Every
//! stored record is also published on the [`EventBus`].

use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AgentCallRecord, AgentRole, CallFilter, CompletionCall, Conversation, Message,
    MessageMetadata, MessageRole, NewCompletionCall, Page, PipelineStep, RetryConfig,
    TerminalContext,
};
use crate::domain::ports::ConversationRepository;
use crate::services::event_bus::{EventBus, EventPayload};

pub struct ConversationLedger {
    repo: Arc<dyn ConversationRepository>,
    event_bus: Arc<EventBus>,
    retry: RetryConfig,
}

impl ConversationLedger {
    pub fn new(
        repo: Arc<dyn ConversationRepository>,
        event_bus: Arc<EventBus>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            repo,
            event_bus,
            retry,
        }
    }

    /// Run `op`, retrying while it fails with a transient error.
    async fn with_retry<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> DomainResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DomainResult<T>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.retry.initial_backoff_ms.max(1)))
            .with_max_interval(Duration::from_millis(self.retry.max_backoff_ms.max(1)))
            .with_max_elapsed_time(Some(Duration::from_millis(self.retry.max_elapsed_ms)))
            .build();
        let max_retries = self.retry.max_retries;
        let mut attempt = 0u32;

        backoff::future::retry(policy, || {
            attempt += 1;
            let current = attempt;
            let fut = op();
            async move {
                fut.await.map_err(|e| {
                    if e.is_transient() && current <= max_retries {
                        tracing::warn!(op = op_name, attempt = current, error = %e, "ledger write contended, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }

    pub async fn get_or_create_conversation(
        &self,
        run_id: Uuid,
        agent: AgentRole,
        step: PipelineStep,
    ) -> DomainResult<Conversation> {
        let conversation = self
            .with_retry("get_or_create_conversation", || {
                self.repo.get_or_create(run_id, agent, step)
            })
            .await?;
        self.event_bus.publish(EventPayload::ConversationOpened {
            conversation: conversation.clone(),
        });
        Ok(conversation)
    }

    pub async fn append_message(
        &self,
        conversation: &Conversation,
        role: MessageRole,
        content: &str,
        artifacts: &[String],
        metadata: MessageMetadata,
    ) -> DomainResult<Message> {
        let message = self
            .with_retry("append_message", || {
                self.repo
                    .append_message(conversation.id, role, content, artifacts, &metadata)
            })
            .await?;
        self.event_bus.publish(EventPayload::MessageAppended {
            run_id: conversation.run_id,
            message: message.clone(),
        });
        Ok(message)
    }

    /// Store a completion call together with its aggregate and history updates.
    pub async fn record_completion_call(&self, new_call: NewCompletionCall) -> DomainResult<CompletionCall> {
        let conversation = self
            .with_retry("get_conversation", || self.repo.get(new_call.conversation_id))
            .await?
            .ok_or(DomainError::ConversationNotFound(new_call.conversation_id))?;

        let call = new_call.into_call();
        let record = AgentCallRecord {
            id: Uuid::new_v4(),
            run_id: conversation.run_id,
            agent: conversation.agent,
            step: conversation.step,
            call_id: call.id,
            status: call.status,
            total_tokens: call.total_tokens,
            created_at: call.created_at,
        };

        self.with_retry("record_completion_call", || self.repo.record_call(&call, &record))
            .await?;

        tracing::debug!(
            run_id = %conversation.run_id,
            agent = %conversation.agent,
            step = %conversation.step,
            deployment = %call.deployment,
            status = call.status.as_str(),
            total_tokens = call.total_tokens,
            "completion call recorded"
        );
        self.event_bus.publish(EventPayload::CompletionRecorded {
            run_id: conversation.run_id,
            call: call.clone(),
            record,
        });
        Ok(call)
    }

    /// Append the distinguished system message that explains why a conversation stopped.
    pub async fn create_terminal_message(
        &self,
        conversation: &Conversation,
        context: &TerminalContext,
    ) -> DomainResult<Message> {
        let mut metadata = MessageMetadata::for_step(conversation.agent, conversation.step);
        metadata.is_error = true;
        metadata.is_terminal = true;
        if let Some(code) = &context.error_code {
            metadata = metadata.with_extra("error_code", serde_json::json!(code));
        }
        if let Some(math) = &context.math {
            metadata = metadata.with_extra("token_math", serde_json::to_value(math)?);
        }
        if !context.truncated_sections.is_empty() {
            metadata = metadata.with_extra(
                "truncated_sections",
                serde_json::to_value(&context.truncated_sections)?,
            );
        }

        self.append_message(conversation, MessageRole::System, &context.render(), &[], metadata)
            .await
    }

    pub async fn conversations_for_run(&self, run_id: Uuid) -> DomainResult<Vec<Conversation>> {
        self.repo.list_for_run(run_id).await
    }

    pub async fn conversation(&self, id: Uuid) -> DomainResult<Option<Conversation>> {
        self.repo.get(id).await
    }

    pub async fn messages(&self, conversation_id: Uuid, page: Page) -> DomainResult<Vec<Message>> {
        self.repo.list_messages(conversation_id, page).await
    }

    pub async fn calls(&self, filter: CallFilter) -> DomainResult<Vec<CompletionCall>> {
        self.repo.list_calls(filter).await
    }

    pub async fn call_history(
        &self,
        run_id: Uuid,
        agent: Option<AgentRole>,
    ) -> DomainResult<Vec<AgentCallRecord>> {
        self.repo.call_history(run_id, agent).await
    }
}
