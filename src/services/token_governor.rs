//! Token governance for outgoing completion requests.
//!
//! Every prompt is measured before it reaches a deployment. Oversized
//! prompts are rejected outright; prompts that leave no room for output are
//! shrunk by cutting the middle out of their largest shrinkable section, a
//! bounded number of times, before being rejected. Admission is pure: no
//! I/O, no clocks, no shared state.

use crate::domain::errors::{GovernanceError, TokenMath};
use crate::domain::models::{
    estimate_tokens, BudgetSnapshot, GovernorConfig, Prompt, TruncatedSection,
};

/// Characters per token used when converting token budgets to slice sizes.
const CHARS_PER_TOKEN: usize = 4;

/// Marker left where the middle of a section was removed.
pub const TRUNCATION_MARKER: &str = "\n[... truncated by foreman ...]\n";

/// A request the governor let through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// The prompt to send, possibly shrunk.
    pub prompt: Prompt,
    pub prompt_tokens: usize,
    /// Output tokens to request from the deployment.
    pub max_output_tokens: usize,
    pub shrunk: bool,
    pub truncated_sections: Vec<TruncatedSection>,
    pub budget: BudgetSnapshot,
}

impl Admission {
    pub fn truncated_tags(&self) -> Vec<String> {
        self.truncated_sections.iter().map(|s| s.tag.clone()).collect()
    }
}

/// Largest byte index `<= idx` that falls on a char boundary.
fn floor_boundary(s: &str, idx: usize) -> usize {
    let mut i = idx.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Smallest byte index `>= idx` that falls on a char boundary.
fn ceil_boundary(s: &str, idx: usize) -> usize {
    let mut i = idx.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Keep roughly `head_tokens` from the start and `tail_tokens` from the end of
/// `content`, replacing the middle with [`TRUNCATION_MARKER`].
///
/// Returns `None` when the result would not be shorter than the input.
pub fn shrink_section(content: &str, head_tokens: usize, tail_tokens: usize) -> Option<String> {
    let head_chars = head_tokens * CHARS_PER_TOKEN;
    let tail_chars = tail_tokens * CHARS_PER_TOKEN;
    if content.len() <= head_chars + tail_chars + TRUNCATION_MARKER.len() {
        return None;
    }

    let head_end = floor_boundary(content, head_chars);
    let tail_start = ceil_boundary(content, content.len() - tail_chars);
    let mut out = String::with_capacity(head_end + TRUNCATION_MARKER.len() + content.len() - tail_start);
    out.push_str(&content[..head_end]);
    out.push_str(TRUNCATION_MARKER);
    out.push_str(&content[tail_start..]);
    Some(out)
}

/// Applies the configured token policy to prompts.
#[derive(Debug, Clone)]
pub struct TokenGovernor {
    config: GovernorConfig,
}

impl TokenGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Decide whether `prompt` may be sent to a deployment with `context_window`.
    ///
    /// `step_tokens_used` is what the current step has already spent; it only
    /// feeds the reported budget.
    pub fn admit(
        &self,
        prompt: &Prompt,
        requested_max_output: usize,
        context_window: usize,
        step_tokens_used: usize,
    ) -> Result<Admission, GovernanceError> {
        let cfg = &self.config;
        let mut prompt = prompt.clone();
        let mut prompt_tokens = prompt.tokens();

        let math = |prompt_tokens: usize, available: i64| TokenMath {
            context_window,
            prompt_tokens,
            safety_buffer: cfg.safety_buffer,
            available_tokens: available,
            prompt_ceiling: cfg.max_prompt_tokens,
            requested_max_tokens: requested_max_output,
        };
        let available_for = |prompt_tokens: usize| {
            context_window as i64 - prompt_tokens as i64 - cfg.safety_buffer as i64
        };

        let mut available = available_for(prompt_tokens);
        if prompt_tokens > cfg.max_prompt_tokens {
            return Err(GovernanceError::PromptTooLarge {
                math: math(prompt_tokens, available),
            });
        }

        let mut truncated: Vec<TruncatedSection> = Vec::new();
        let mut attempts = 0;
        let mut head = cfg.shrink_head_tokens;
        let mut tail = cfg.shrink_tail_tokens;

        while available <= 0 && attempts < cfg.max_shrink_attempts {
            attempts += 1;
            let Some(idx) = prompt.largest_shrinkable() else {
                break;
            };
            let section = &mut prompt.sections[idx];
            if let Some(shrunk) = shrink_section(&section.content, head, tail) {
                let original_tokens = estimate_tokens(&section.content);
                let kept_tokens = estimate_tokens(&shrunk);
                match truncated.iter_mut().find(|t| t.tag == section.tag) {
                    Some(existing) => existing.kept_tokens = kept_tokens,
                    None => truncated.push(TruncatedSection {
                        tag: section.tag.clone(),
                        original_tokens,
                        kept_tokens,
                    }),
                }
                tracing::debug!(
                    section = %section.tag,
                    attempt = attempts,
                    original_tokens,
                    kept_tokens,
                    "shrunk prompt section"
                );
                section.content = shrunk;
            }
            head /= 2;
            tail /= 2;
            prompt_tokens = prompt.tokens();
            available = available_for(prompt_tokens);
        }

        if available <= 0 {
            return Err(GovernanceError::ContextExhausted {
                math: math(prompt_tokens, available),
                attempts,
                truncated_sections: truncated,
            });
        }

        let max_output_tokens = requested_max_output
            .min(available as usize)
            .min(cfg.hard_output_cap);

        let budget = BudgetSnapshot {
            context_window,
            prompt_tokens,
            safety_buffer: cfg.safety_buffer,
            available,
            remaining_prompt_budget: cfg.max_prompt_tokens as i64 - prompt_tokens as i64,
            remaining_step_budget: cfg.step_token_budget as i64
                - step_tokens_used as i64
                - prompt_tokens as i64,
        };

        Ok(Admission {
            shrunk: !truncated.is_empty(),
            prompt,
            prompt_tokens,
            max_output_tokens,
            truncated_sections: truncated,
            budget,
        })
    }
}
