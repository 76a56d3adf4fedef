//! The outer completion call loop.
//!
//! Each attempt re-selects a deployment and re-runs governance against that
//! deployment's context window, so a throttled deployment is replaced by one
//! that may have a different budget. Throttles and transient failures are
//! retried up to the attempt ceiling; fatal provider errors and governance
//! rejections end the call at once. Exactly one [`CompletionCall`] is
//! recorded per logical call, carrying the number of attempts it took.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use sha2::{Digest, Sha256};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult, GovernanceError};
use crate::domain::models::{
    AgentRole, BudgetSnapshot, CallStatus, CompletionCall, Conversation, Deployment,
    DispatcherConfig, MessageMetadata, MessageRole, NewCompletionCall, PipelineStep, Prompt,
    RateLimitConfig, TerminalContext, TruncatedSection,
};
use crate::domain::ports::{ChatMessage, CompletionError, CompletionProvider, CompletionResponse};
use crate::services::conversation_ledger::ConversationLedger;
use crate::services::deployment_dispatcher::DeploymentDispatcher;
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::token_governor::{Admission, TokenGovernor};

/// Default ceiling on a single provider call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// SHA-256 of `text`, hex encoded.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// A completion requested by an agent during a step.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub run_id: Uuid,
    pub agent: AgentRole,
    pub step: PipelineStep,
    pub prompt: Prompt,
    /// Output tokens wanted; the governor's default when `None`.
    pub max_output_tokens: Option<usize>,
}

impl CompletionRequest {
    pub fn new(run_id: Uuid, agent: AgentRole, step: PipelineStep, prompt: Prompt) -> Self {
        Self {
            run_id,
            agent,
            step,
            prompt,
            max_output_tokens: None,
        }
    }
}

/// A successful completion and its ledger record.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub content: String,
    pub call: CompletionCall,
    pub truncated_sections: Vec<TruncatedSection>,
}

pub struct CompletionService {
    dispatcher: Arc<DeploymentDispatcher>,
    governor: TokenGovernor,
    provider: Arc<dyn CompletionProvider>,
    ledger: Arc<ConversationLedger>,
    event_bus: Arc<EventBus>,
    quota: Option<Arc<DefaultDirectRateLimiter>>,
    max_attempts: u32,
    transient_backoff: Duration,
    call_timeout: Duration,
}

/// Facts about the attempt that ended a call.
struct Attempt {
    number: u32,
    deployment: String,
    prompt_hash: String,
    prompt_tokens: i64,
    requested_max_tokens: i64,
    budget: BudgetSnapshot,
    truncated_sections: Vec<String>,
    latency_ms: i64,
}

impl CompletionService {
    pub fn new(
        dispatcher: Arc<DeploymentDispatcher>,
        governor: TokenGovernor,
        provider: Arc<dyn CompletionProvider>,
        ledger: Arc<ConversationLedger>,
        event_bus: Arc<EventBus>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            dispatcher,
            governor,
            provider,
            ledger,
            event_bus,
            quota: None,
            max_attempts: config.max_attempts.max(1),
            transient_backoff: Duration::from_millis(config.transient_backoff_ms),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Apply a process-wide request quota before every provider call.
    #[must_use]
    pub fn with_quota(mut self, config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return self;
        }
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(per_second);
        let quota = Quota::per_second(per_second).allow_burst(burst);
        self.quota = Some(Arc::new(RateLimiter::direct(quota)));
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn ledger(&self) -> &Arc<ConversationLedger> {
        &self.ledger
    }

    pub fn dispatcher(&self) -> &Arc<DeploymentDispatcher> {
        &self.dispatcher
    }

    /// Run one logical completion call to success or a final error.
    pub async fn complete(&self, request: CompletionRequest) -> DomainResult<CompletionOutcome> {
        let conversation = self
            .ledger
            .get_or_create_conversation(request.run_id, request.agent, request.step)
            .await?;
        let requested = request
            .max_output_tokens
            .unwrap_or(self.governor.config().default_max_output_tokens);
        let step_tokens_used = conversation.total_tokens.max(0) as usize;

        let mut last_error = String::new();
        let mut last_attempt: Option<Attempt> = None;
        for number in 1..=self.max_attempts {
            let deployment = self.dispatcher.select().await;

            let admission = match self.governor.admit(
                &request.prompt,
                requested,
                deployment.context_window,
                step_tokens_used,
            ) {
                Ok(admission) => admission,
                Err(err) => {
                    return Err(self
                        .reject(&conversation, &request, &deployment, number, requested, step_tokens_used, err)
                        .await);
                }
            };

            if let Some(quota) = &self.quota {
                quota.until_ready().await;
            }

            let rendered = admission.prompt.render();
            let messages = vec![ChatMessage::user(rendered.clone())];
            let started = Instant::now();
            let result = tokio::time::timeout(
                self.call_timeout,
                self.provider
                    .complete(&deployment.name, &messages, admission.max_output_tokens),
            )
            .await
            .unwrap_or_else(|_| {
                Err(CompletionError::Transient(format!(
                    "no response within {}s",
                    self.call_timeout.as_secs()
                )))
            });
            let attempt = Attempt {
                number,
                deployment: deployment.name.clone(),
                prompt_hash: sha256_hex(&rendered),
                prompt_tokens: admission.prompt_tokens as i64,
                requested_max_tokens: admission.max_output_tokens as i64,
                budget: admission.budget.clone(),
                truncated_sections: admission.truncated_tags(),
                latency_ms: started.elapsed().as_millis() as i64,
            };

            match result {
                Ok(response) => {
                    return self
                        .accept(&conversation, &deployment, &admission, attempt, rendered, response)
                        .await;
                }
                Err(CompletionError::Throttled { retry_after }) => {
                    let state = self
                        .dispatcher
                        .mark_throttled(&deployment.name, retry_after)
                        .await;
                    self.event_bus
                        .publish(EventPayload::DeploymentThrottled { state });
                    last_error = format!("deployment {} throttled", deployment.name);
                    last_attempt = Some(attempt);
                }
                Err(CompletionError::Transient(message)) => {
                    tracing::warn!(
                        deployment = %deployment.name,
                        attempt = number,
                        error = %message,
                        "transient completion failure"
                    );
                    last_error = message;
                    last_attempt = Some(attempt);
                    if number < self.max_attempts {
                        tokio::time::sleep(self.transient_backoff).await;
                    }
                }
                Err(err @ CompletionError::Fatal(_)) => {
                    self.record_failure(&conversation, attempt, err.code(), &err.to_string())
                        .await?;
                    return Err(DomainError::CompletionFailed {
                        deployment: deployment.name.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        tracing::error!(
            run_id = %request.run_id,
            agent = %request.agent,
            step = %request.step,
            attempts = self.max_attempts,
            error = %last_error,
            "completion retries exhausted"
        );
        // The record describes the last attempt as it was actually sent.
        let attempt = last_attempt.unwrap_or_else(|| Attempt {
            number: self.max_attempts,
            deployment: String::new(),
            prompt_hash: sha256_hex(&request.prompt.render()),
            prompt_tokens: request.prompt.tokens() as i64,
            requested_max_tokens: requested as i64,
            budget: BudgetSnapshot::default(),
            truncated_sections: Vec::new(),
            latency_ms: 0,
        });
        self.record_failure(&conversation, attempt, "retries_exhausted", &last_error)
            .await?;
        Err(DomainError::RetriesExhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }

    async fn accept(
        &self,
        conversation: &Conversation,
        deployment: &Deployment,
        admission: &Admission,
        attempt: Attempt,
        rendered: String,
        response: CompletionResponse,
    ) -> DomainResult<CompletionOutcome> {
        let status = if admission.shrunk {
            CallStatus::Truncated
        } else {
            CallStatus::Success
        };
        let call = self
            .ledger
            .record_completion_call(NewCompletionCall {
                conversation_id: conversation.id,
                deployment: deployment.name.clone(),
                prompt_tokens: response.prompt_tokens,
                completion_tokens: response.completion_tokens,
                requested_max_tokens: attempt.requested_max_tokens,
                latency_ms: attempt.latency_ms,
                status,
                error_code: None,
                truncated_sections: attempt.truncated_sections,
                prompt_hash: attempt.prompt_hash,
                response_hash: Some(sha256_hex(&response.content)),
                budget: attempt.budget,
                cost: deployment.cost(response.prompt_tokens, response.completion_tokens),
                attempts: attempt.number,
            })
            .await?;

        let metadata =
            MessageMetadata::for_step(conversation.agent, conversation.step).with_attempt(attempt.number);
        self.ledger
            .append_message(conversation, MessageRole::User, &rendered, &[], metadata.clone())
            .await?;
        self.ledger
            .append_message(
                conversation,
                MessageRole::Assistant,
                &response.content,
                &[],
                metadata.with_extra("call_id", serde_json::json!(call.id)),
            )
            .await?;

        Ok(CompletionOutcome {
            content: response.content,
            call,
            truncated_sections: admission.truncated_sections.clone(),
        })
    }

    async fn record_failure(
        &self,
        conversation: &Conversation,
        attempt: Attempt,
        code: &str,
        message: &str,
    ) -> DomainResult<()> {
        self.ledger
            .record_completion_call(NewCompletionCall {
                conversation_id: conversation.id,
                deployment: attempt.deployment,
                prompt_tokens: attempt.prompt_tokens,
                completion_tokens: 0,
                requested_max_tokens: attempt.requested_max_tokens,
                latency_ms: attempt.latency_ms,
                status: CallStatus::Failed,
                error_code: Some(code.to_string()),
                truncated_sections: attempt.truncated_sections,
                prompt_hash: attempt.prompt_hash,
                response_hash: None,
                budget: attempt.budget,
                cost: 0.0,
                attempts: attempt.number,
            })
            .await?;

        let mut metadata = MessageMetadata::for_step(conversation.agent, conversation.step)
            .with_attempt(attempt.number)
            .with_extra("error_code", serde_json::json!(code));
        metadata.is_error = true;
        self.ledger
            .append_message(conversation, MessageRole::System, message, &[], metadata)
            .await?;
        Ok(())
    }

    /// Record a governance rejection and return the error to propagate.
    #[allow(clippy::too_many_arguments)]
    async fn reject(
        &self,
        conversation: &Conversation,
        request: &CompletionRequest,
        deployment: &Deployment,
        attempt: u32,
        requested: usize,
        step_tokens_used: usize,
        err: GovernanceError,
    ) -> DomainError {
        let math = err.math();
        let cfg = self.governor.config();
        tracing::warn!(
            run_id = %request.run_id,
            agent = %request.agent,
            step = %request.step,
            deployment = %deployment.name,
            code = err.code(),
            %math,
            "completion rejected by token governor"
        );

        let budget = BudgetSnapshot {
            context_window: math.context_window,
            prompt_tokens: math.prompt_tokens,
            safety_buffer: math.safety_buffer,
            available: math.available_tokens,
            remaining_prompt_budget: cfg.max_prompt_tokens as i64 - math.prompt_tokens as i64,
            remaining_step_budget: cfg.step_token_budget as i64
                - step_tokens_used as i64
                - math.prompt_tokens as i64,
        };
        let recorded = self
            .ledger
            .record_completion_call(NewCompletionCall {
                conversation_id: conversation.id,
                deployment: deployment.name.clone(),
                prompt_tokens: 0,
                completion_tokens: 0,
                requested_max_tokens: requested as i64,
                latency_ms: 0,
                status: CallStatus::Skipped,
                error_code: Some(err.code().to_string()),
                truncated_sections: err
                    .truncated_sections()
                    .iter()
                    .map(|s| s.tag.clone())
                    .collect(),
                prompt_hash: sha256_hex(&request.prompt.render()),
                response_hash: None,
                budget,
                cost: 0.0,
                attempts: attempt,
            })
            .await;
        if let Err(e) = recorded {
            return e;
        }

        let context = TerminalContext::from_governance(request.run_id, &err);
        if let Err(e) = self.ledger.create_terminal_message(conversation, &context).await {
            return e;
        }
        DomainError::Governance(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::completion::ScriptedProvider;
    use crate::adapters::sqlite::{
        create_migrated_test_pool, SqliteConversationRepository, SqliteRunRepository,
    };
    use crate::domain::models::{
        CallFilter, GovernorConfig, Page, PromptSection, RetryConfig, Run,
    };
    use crate::domain::ports::RunRepository;
    use crate::services::deployment_dispatcher::RateLimitRegistry;

    struct Harness {
        service: CompletionService,
        provider: Arc<ScriptedProvider>,
        ledger: Arc<ConversationLedger>,
        dispatcher: Arc<DeploymentDispatcher>,
        run: Run,
    }

    async fn harness(deployments: &[&str], max_attempts: u32) -> Harness {
        let pool = create_migrated_test_pool().await.unwrap();
        let run = Run::new("T-1");
        SqliteRunRepository::new(pool.clone()).create(&run).await.unwrap();

        let bus = Arc::new(EventBus::default());
        let ledger = Arc::new(ConversationLedger::new(
            Arc::new(SqliteConversationRepository::new(pool)),
            bus.clone(),
            RetryConfig::default(),
        ));
        let dispatcher = Arc::new(
            DeploymentDispatcher::new(
                deployments.iter().map(|n| Deployment::new(*n, 8_000)).collect(),
                Arc::new(RateLimitRegistry::new()),
            )
            .unwrap(),
        );
        let provider = Arc::new(ScriptedProvider::with_default_reply("done"));
        let config = DispatcherConfig {
            max_attempts,
            transient_backoff_ms: 1,
            ..DispatcherConfig::default()
        };
        let service = CompletionService::new(
            dispatcher.clone(),
            TokenGovernor::new(GovernorConfig::default()),
            provider.clone(),
            ledger.clone(),
            bus,
            &config,
        );
        Harness {
            service,
            provider,
            ledger,
            dispatcher,
            run,
        }
    }

    fn request(run: &Run, body: &str) -> CompletionRequest {
        CompletionRequest::new(
            run.id,
            AgentRole::Architect,
            PipelineStep::GeneratePlan,
            Prompt::new()
                .with(PromptSection::fixed("instructions", "Write a plan."))
                .with(PromptSection::shrinkable("ticket", body)),
        )
    }

    #[tokio::test]
    async fn test_throttled_deployments_are_skipped() {
        let h = harness(&["a", "b", "c"], 6).await;
        h.provider
            .fail_next("a", CompletionError::Throttled { retry_after: None })
            .await;
        h.provider
            .fail_next(
                "b",
                CompletionError::Throttled {
                    retry_after: Some(Duration::from_secs(30)),
                },
            )
            .await;

        let outcome = h.service.complete(request(&h.run, "Add login")).await.unwrap();
        assert_eq!(outcome.content, "done");
        assert_eq!(outcome.call.deployment, "c");
        assert_eq!(outcome.call.attempts, 3);
        assert_eq!(outcome.call.status, CallStatus::Success);
        assert_eq!(outcome.call.response_hash, Some(sha256_hex("done")));

        let throttled: Vec<String> = h
            .dispatcher
            .snapshot()
            .await
            .into_iter()
            .map(|s| s.deployment)
            .collect();
        assert_eq!(throttled, vec!["a".to_string(), "b".to_string()]);

        let calls = h.ledger.calls(CallFilter::default()).await.unwrap();
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn test_success_appends_prompt_and_reply() {
        let h = harness(&["a"], 6).await;
        let outcome = h.service.complete(request(&h.run, "Add login")).await.unwrap();

        let messages = h
            .ledger
            .messages(outcome.call.conversation_id, Page::default())
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert!(messages[0].content.contains("Add login"));
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].metadata.attempt, Some(1));
    }

    #[tokio::test]
    async fn test_oversized_prompt_is_skipped_with_terminal_message() {
        let h = harness(&["a"], 6).await;
        let huge = "x".repeat(GovernorConfig::default().max_prompt_tokens * 4 + 100);

        let err = h.service.complete(request(&h.run, &huge)).await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::Governance(GovernanceError::PromptTooLarge { .. })
        ));
        assert!(h.provider.calls().await.is_empty());

        let calls = h.ledger.calls(CallFilter::default()).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, CallStatus::Skipped);
        assert_eq!(calls[0].error_code.as_deref(), Some("prompt_too_large"));

        let messages = h
            .ledger
            .messages(calls[0].conversation_id, Page::default())
            .await
            .unwrap();
        assert!(messages.last().unwrap().metadata.is_terminal);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let h = harness(&["a", "b"], 6).await;
        h.provider
            .fail_next("a", CompletionError::Fatal("invalid api key".into()))
            .await;

        let err = h.service.complete(request(&h.run, "Add login")).await.unwrap_err();
        assert!(matches!(err, DomainError::CompletionFailed { .. }));
        assert_eq!(h.provider.calls().await.len(), 1);

        let calls = h.ledger.calls(CallFilter::default()).await.unwrap();
        assert_eq!(calls[0].status, CallStatus::Failed);
        assert_eq!(calls[0].error_code.as_deref(), Some("provider_error"));
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_attempts() {
        let h = harness(&["a"], 2).await;
        for _ in 0..2 {
            h.provider
                .fail_next("a", CompletionError::Transient("502".into()))
                .await;
        }

        let err = h.service.complete(request(&h.run, "Add login")).await.unwrap_err();
        match err {
            DomainError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_error, "502");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let calls = h.ledger.calls(CallFilter::default()).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].attempts, 2);
        assert_eq!(calls[0].error_code.as_deref(), Some("retries_exhausted"));
    }

    #[tokio::test]
    async fn test_exhausted_record_describes_last_attempt_sent() {
        let h = harness(&["a", "b"], 2).await;
        h.provider
            .fail_next("a", CompletionError::Transient("502".into()))
            .await;
        h.provider
            .fail_next("b", CompletionError::Transient("503".into()))
            .await;
        // Larger than the 8k window, so the governor has to shrink it.
        let req = request(&h.run, &"word ".repeat(8_000));
        let expected = TokenGovernor::new(GovernorConfig::default())
            .admit(&req.prompt, 2_048, 8_000, 0)
            .unwrap();
        assert!(expected.shrunk);

        let err = h.service.complete(req.clone()).await.unwrap_err();
        assert!(matches!(err, DomainError::RetriesExhausted { .. }));

        let calls = h.ledger.calls(CallFilter::default()).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].deployment, "b");
        assert_eq!(calls[0].prompt_tokens, expected.prompt_tokens as i64);
        assert!(calls[0].prompt_tokens < req.prompt.tokens() as i64);
        assert_eq!(calls[0].truncated_sections, expected.truncated_tags());
        assert_eq!(calls[0].prompt_hash, sha256_hex(&expected.prompt.render()));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
