//! HTTP client for OpenAI-compatible chat completion endpoints.
//!
//! The deployment name is sent as the model. Responses are classified for
//! the call loop: 429 is throttling (honouring `Retry-After`), 408/5xx and
//! network failures are transient, anything else is fatal.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::ports::{ChatMessage, CompletionError, CompletionProvider, CompletionResponse};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: usize,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: i64,
    completion_tokens: i64,
}

/// OpenAI-compatible completion provider.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Build a provider reading the API key from `api_key_env`, if set.
    pub fn from_env(base_url: impl Into<String>, api_key_env: &str, timeout: Duration) -> Self {
        let api_key = std::env::var(api_key_env).ok().filter(|k| !k.is_empty());
        Self::new(base_url, api_key, timeout)
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> CompletionError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        CompletionError::Throttled { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        CompletionError::Transient(format!("endpoint returned {status}: {body}"))
    } else {
        CompletionError::Fatal(format!("endpoint returned {status}: {body}"))
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    async fn complete(
        &self,
        deployment: &str,
        messages: &[ChatMessage],
        max_tokens: usize,
    ) -> Result<CompletionResponse, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: deployment,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            max_tokens,
        };

        let mut req = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                CompletionError::Transient(format!("request to {deployment} failed: {e}"))
            } else {
                CompletionError::Fatal(format!("request to {deployment} failed: {e}"))
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let retry_after = parse_retry_after(resp.headers());
            let body_text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, body_text));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| CompletionError::Fatal(format!("malformed completion response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CompletionError::Fatal("completion response had no choices".to_string()))?;

        let (prompt_tokens, completion_tokens) = parsed.usage.map_or_else(
            || {
                let prompt: usize = messages
                    .iter()
                    .map(|m| crate::domain::models::estimate_tokens(&m.content))
                    .sum();
                (prompt as i64, crate::domain::models::estimate_tokens(&content) as i64)
            },
            |u| (u.prompt_tokens, u.completion_tokens),
        );

        Ok(CompletionResponse {
            content,
            prompt_tokens,
            completion_tokens,
        })
    }
}
