//! Deployment pool view.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::cli::bootstrap::Foreman;
use crate::cli::output::{list_table, output, render_list, CommandOutput};

#[derive(Args, Debug)]
pub struct DeploymentArgs {}

#[derive(Debug, Serialize)]
pub struct DeploymentOutput {
    pub name: String,
    pub context_window: usize,
    pub prompt_cost_per_1k: f64,
    pub completion_cost_per_1k: f64,
    pub rate_limited_until: Option<String>,
    pub throttle_count: u32,
}

#[derive(Debug, Serialize)]
pub struct DeploymentListOutput {
    pub deployments: Vec<DeploymentOutput>,
}

impl CommandOutput for DeploymentListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["name", "context", "cost/1k in", "cost/1k out", "throttled until", "throttles"]);
        for d in &self.deployments {
            table.add_row(vec![
                d.name.clone(),
                d.context_window.to_string(),
                format!("{:.4}", d.prompt_cost_per_1k),
                format!("{:.4}", d.completion_cost_per_1k),
                d.rate_limited_until.clone().unwrap_or_else(|| "-".to_string()),
                d.throttle_count.to_string(),
            ]);
        }
        render_list("deployment", &table, self.deployments.len())
    }
}

pub async fn execute(_args: DeploymentArgs, foreman: &Foreman, json: bool) -> Result<()> {
    let states = foreman.dispatcher.snapshot().await;
    let now = chrono::Utc::now();
    let deployments = foreman
        .dispatcher
        .pool()
        .iter()
        .map(|d| {
            let state = states.iter().find(|s| s.deployment == d.name);
            DeploymentOutput {
                name: d.name.clone(),
                context_window: d.context_window,
                prompt_cost_per_1k: d.prompt_cost_per_1k,
                completion_cost_per_1k: d.completion_cost_per_1k,
                rate_limited_until: state
                    .filter(|s| s.is_limited_at(now))
                    .map(|s| s.rate_limited_until.to_rfc3339()),
                throttle_count: state.map_or(0, |s| s.throttle_count),
            }
        })
        .collect();
    output(&DeploymentListOutput { deployments }, json);
    Ok(())
}
