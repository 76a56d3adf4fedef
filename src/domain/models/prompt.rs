//! Structured prompts and the token budget attached to each admitted request.

use serde::{Deserialize, Serialize};

/// Estimate tokens for a piece of text using the 4-characters-per-token
/// heuristic, rounding up.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

/// One tagged section of a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSection {
    pub tag: String,
    pub content: String,
    /// Whether the governor may cut the middle out of this section.
    pub shrinkable: bool,
}

impl PromptSection {
    pub fn fixed(tag: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            content: content.into(),
            shrinkable: false,
        }
    }

    pub fn shrinkable(tag: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            content: content.into(),
            shrinkable: true,
        }
    }

    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.render())
    }

    /// Rendered form used for both token counting and the final text.
    pub fn render(&self) -> String {
        format!("## {}\n{}\n", self.tag, self.content)
    }
}

/// An ordered list of tagged sections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub sections: Vec<PromptSection>,
}

impl Prompt {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, section: PromptSection) -> Self {
        self.sections.push(section);
        self
    }

    pub fn push(&mut self, section: PromptSection) {
        self.sections.push(section);
    }

    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.render())
    }

    pub fn render(&self) -> String {
        self.sections
            .iter()
            .map(PromptSection::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Index of the largest shrinkable section, if any.
    pub fn largest_shrinkable(&self) -> Option<usize> {
        self.sections
            .iter()
            .enumerate()
            .filter(|(_, s)| s.shrinkable)
            .max_by_key(|(_, s)| s.content.len())
            .map(|(i, _)| i)
    }
}

/// Record of a section cut down by the governor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedSection {
    pub tag: String,
    pub original_tokens: usize,
    pub kept_tokens: usize,
}

/// Budget figures computed when a request was admitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub context_window: usize,
    pub prompt_tokens: usize,
    pub safety_buffer: usize,
    pub available: i64,
    /// Per-step prompt ceiling minus the prompt actually sent.
    pub remaining_prompt_budget: i64,
    /// Per-step token budget minus what the step had already spent.
    pub remaining_step_budget: i64,
}
