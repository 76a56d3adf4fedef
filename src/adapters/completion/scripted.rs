//! Scripted completion provider for tests and offline runs.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use crate::domain::models::estimate_tokens;
use crate::domain::ports::{ChatMessage, CompletionError, CompletionProvider, CompletionResponse};

/// A call observed by the scripted provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub deployment: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: usize,
}

/// Provider that answers from canned rules.
///
/// Replies are chosen by the first rule whose needle appears in any message,
/// falling back to the default reply. Failures queued for a deployment are
/// returned, in order, before that deployment answers normally.
pub struct ScriptedProvider {
    default_reply: String,
    rules: Mutex<Vec<(String, String)>>,
    failures: Mutex<HashMap<String, VecDeque<CompletionError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::with_default_reply("Acknowledged.")
    }

    pub fn with_default_reply(reply: impl Into<String>) -> Self {
        Self {
            default_reply: reply.into(),
            rules: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reply with `reply` whenever a message contains `needle`.
    pub async fn reply_when(&self, needle: impl Into<String>, reply: impl Into<String>) {
        self.rules.lock().await.push((needle.into(), reply.into()));
    }

    /// Queue a failure for the next call routed to `deployment`.
    pub async fn fail_next(&self, deployment: impl Into<String>, error: CompletionError) {
        self.failures
            .lock()
            .await
            .entry(deployment.into())
            .or_default()
            .push_back(error);
    }

    /// All calls observed so far, in order.
    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    async fn reply_for(&self, messages: &[ChatMessage]) -> String {
        let rules = self.rules.lock().await;
        rules
            .iter()
            .find(|(needle, _)| messages.iter().any(|m| m.content.contains(needle.as_str())))
            .map_or_else(|| self.default_reply.clone(), |(_, reply)| reply.clone())
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn complete(
        &self,
        deployment: &str,
        messages: &[ChatMessage],
        max_tokens: usize,
    ) -> Result<CompletionResponse, CompletionError> {
        self.calls.lock().await.push(RecordedCall {
            deployment: deployment.to_string(),
            messages: messages.to_vec(),
            max_tokens,
        });

        let queued = self
            .failures
            .lock()
            .await
            .get_mut(deployment)
            .and_then(VecDeque::pop_front);
        if let Some(error) = queued {
            return Err(error);
        }

        let content = self.reply_for(messages).await;
        let prompt_tokens: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        Ok(CompletionResponse {
            completion_tokens: estimate_tokens(&content) as i64,
            prompt_tokens: prompt_tokens as i64,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_rules_and_default_reply() {
        let provider = ScriptedProvider::new();
        provider.reply_when("planner", "- task one").await;

        let planned = provider
            .complete("a", &[ChatMessage::system("You are the planner")], 100)
            .await
            .unwrap();
        assert_eq!(planned.content, "- task one");

        let other = provider
            .complete("a", &[ChatMessage::user("hello")], 100)
            .await
            .unwrap();
        assert_eq!(other.content, "Acknowledged.");
        assert_eq!(provider.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_per_deployment_and_ordered() {
        let provider = ScriptedProvider::new();
        provider
            .fail_next(
                "a",
                CompletionError::Throttled {
                    retry_after: Some(Duration::from_secs(5)),
                },
            )
            .await;
        provider
            .fail_next("a", CompletionError::Transient("reset".into()))
            .await;

        let msgs = [ChatMessage::user("x")];
        assert!(provider.complete("b", &msgs, 10).await.is_ok());
        assert!(matches!(
            provider.complete("a", &msgs, 10).await,
            Err(CompletionError::Throttled { .. })
        ));
        assert!(matches!(
            provider.complete("a", &msgs, 10).await,
            Err(CompletionError::Transient(_))
        ));
        assert!(provider.complete("a", &msgs, 10).await.is_ok());
    }
}
