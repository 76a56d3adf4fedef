//! Model deployments and their throttling state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One interchangeable model deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub context_window: usize,
    /// Cost per 1000 prompt tokens.
    #[serde(default)]
    pub prompt_cost_per_1k: f64,
    /// Cost per 1000 completion tokens.
    #[serde(default)]
    pub completion_cost_per_1k: f64,
}

impl Deployment {
    pub fn new(name: impl Into<String>, context_window: usize) -> Self {
        Self {
            name: name.into(),
            context_window,
            prompt_cost_per_1k: 0.0,
            completion_cost_per_1k: 0.0,
        }
    }

    pub fn cost(&self, prompt_tokens: i64, completion_tokens: i64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.prompt_cost_per_1k
            + (completion_tokens as f64 / 1000.0) * self.completion_cost_per_1k
    }
}

/// Reporting view of a deployment's throttling state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub deployment: String,
    pub rate_limited_until: DateTime<Utc>,
    pub throttle_count: u32,
}

impl DeploymentState {
    pub fn is_limited_at(&self, now: DateTime<Utc>) -> bool {
        self.rate_limited_until > now
    }
}
