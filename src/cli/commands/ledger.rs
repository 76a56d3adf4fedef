//! Read-only views over the conversation ledger.

use anyhow::{anyhow, Context, Result};
use clap::Args;
use serde::Serialize;

use crate::cli::bootstrap::Foreman;
use crate::cli::id_resolver::resolve_run_id;
use crate::cli::output::{list_table, output, render_list, truncate, CommandOutput};
use crate::domain::models::{AgentRole, CallFilter, CallStatus, CompletionCall, Message, Page, PipelineStep};

#[derive(Args, Debug)]
pub struct CallsArgs {
    /// Run ID or unique prefix
    #[arg(long)]
    pub run: Option<String>,
    /// Filter by agent (orchestrator, planner, architect, implementer, tester, reviewer, ...)
    #[arg(long)]
    pub agent: Option<String>,
    /// Filter by pipeline step
    #[arg(long)]
    pub step: Option<String>,
    /// Filter by status (success, failed, truncated, skipped)
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long, default_value_t = 50)]
    pub limit: u32,
    #[arg(long, default_value_t = 0)]
    pub offset: u32,
}

#[derive(Args, Debug)]
pub struct MessagesArgs {
    /// Run ID or unique prefix
    pub run: String,
    /// Only this agent's conversations
    #[arg(long)]
    pub agent: Option<String>,
    /// Messages per conversation
    #[arg(long, default_value_t = 100)]
    pub limit: u32,
}

#[derive(Debug, Serialize)]
pub struct CallListOutput {
    pub calls: Vec<CompletionCall>,
    pub total: usize,
}

impl CommandOutput for CallListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&[
            "id", "deployment", "status", "prompt", "completion", "attempts", "latency", "error",
        ]);
        for call in &self.calls {
            table.add_row(vec![
                call.id.to_string()[..8].to_string(),
                if call.deployment.is_empty() { "-".to_string() } else { call.deployment.clone() },
                call.status.as_str().to_string(),
                call.prompt_tokens.to_string(),
                call.completion_tokens.to_string(),
                call.attempts.to_string(),
                format!("{}ms", call.latency_ms),
                call.error_code.clone().unwrap_or_default(),
            ]);
        }
        render_list("call", &table, self.total)
    }
}

#[derive(Debug, Serialize)]
pub struct ConversationMessages {
    pub conversation_id: String,
    pub agent: String,
    pub step: String,
    pub total_tokens: i64,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct MessageListOutput {
    pub conversations: Vec<ConversationMessages>,
}

impl CommandOutput for MessageListOutput {
    fn to_human(&self) -> String {
        if self.conversations.is_empty() {
            return "No conversations found.".to_string();
        }
        let mut sections = Vec::new();
        for conversation in &self.conversations {
            let mut lines = vec![format!(
                "== {} @ {} ({} tokens)",
                conversation.agent, conversation.step, conversation.total_tokens
            )];
            for message in &conversation.messages {
                let flag = if message.metadata.is_terminal {
                    " [terminal]"
                } else if message.metadata.is_error {
                    " [error]"
                } else {
                    ""
                };
                lines.push(format!(
                    "  #{} {:?}{}: {}",
                    message.sequence,
                    message.role,
                    flag,
                    truncate(&message.content.replace('\n', " "), 100)
                ));
            }
            sections.push(lines.join("\n"));
        }
        sections.join("\n\n")
    }
}

fn parse_agent(agent: Option<&str>) -> Result<Option<AgentRole>> {
    agent
        .map(|a| AgentRole::from_str(a).ok_or_else(|| anyhow!("Unknown agent '{a}'")))
        .transpose()
}

pub async fn calls(args: CallsArgs, foreman: &Foreman, json: bool) -> Result<()> {
    let run_id = match args.run.as_deref() {
        Some(prefix) => Some(resolve_run_id(&foreman.pool, prefix).await?),
        None => None,
    };
    let step = args
        .step
        .as_deref()
        .map(|s| PipelineStep::from_str(s).ok_or_else(|| anyhow!("Unknown step '{s}'")))
        .transpose()?;
    let status = args
        .status
        .as_deref()
        .map(|s| CallStatus::from_str(s).ok_or_else(|| anyhow!("Unknown call status '{s}'")))
        .transpose()?;

    let calls = foreman
        .ledger
        .calls(CallFilter {
            run_id,
            agent: parse_agent(args.agent.as_deref())?,
            step,
            status,
            limit: Some(args.limit),
            offset: Some(args.offset),
        })
        .await
        .context("Failed to list calls")?;
    let total = calls.len();
    output(&CallListOutput { calls, total }, json);
    Ok(())
}

pub async fn messages(args: MessagesArgs, foreman: &Foreman, json: bool) -> Result<()> {
    let run_id = resolve_run_id(&foreman.pool, &args.run).await?;
    let agent = parse_agent(args.agent.as_deref())?;
    let page = Page {
        limit: args.limit,
        offset: 0,
    };

    let mut conversations = Vec::new();
    for conversation in foreman.ledger.conversations_for_run(run_id).await? {
        if agent.is_some_and(|a| a != conversation.agent) {
            continue;
        }
        let messages = foreman.ledger.messages(conversation.id, page).await?;
        conversations.push(ConversationMessages {
            conversation_id: conversation.id.to_string(),
            agent: conversation.agent.to_string(),
            step: conversation.step.to_string(),
            total_tokens: conversation.total_tokens,
            messages,
        });
    }
    output(&MessageListOutput { conversations }, json);
    Ok(())
}
