//! Agent implementations for the pipeline steps.
//!
//! [`LlmPipelineAgents`] builds each prompt from tagged sections, sends it
//! through the [`CompletionService`] and talks to the ticketing and
//! source-control collaborators. The handoff handlers ask the target role
//! through the same completion path.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    AgentRole, CodebaseIndex, Collaboration, CollaborationType, Escalation, ExecutionSummary,
    FileChange, HandoffStatus, ImplementationPlan, PipelineStep, PlannedTask, Prompt,
    PromptSection, ReviewOutcome, ReviewVerdict, Run, StepLogEntry, StepLogExt, TaskBreakdown,
    TicketAnalysis,
};
use crate::domain::ports::{SourceControlClient, TicketingClient};
use crate::services::completion_service::{CompletionRequest, CompletionService};
use crate::services::handoff_router::{CollaborationHandler, EscalationHandler, HandoffRouter};

/// Directories never indexed.
const SKIPPED_DIRS: &[&str] = &[".git", ".foreman", "target", "node_modules"];

/// Paths kept in the codebase index sample.
const SAMPLE_PATHS: usize = 50;

/// Everything an agent can see while running a step.
pub struct StepContext<'a> {
    pub run: &'a Run,
    /// Entries of the steps already executed.
    pub log: &'a [StepLogEntry],
    pub router: &'a HandoffRouter,
}

/// One method per agent-driven pipeline step.
#[async_trait]
pub trait PipelineAgents: Send + Sync {
    async fn retrieve_ticket(&self, ctx: &StepContext<'_>) -> DomainResult<TicketAnalysis>;

    async fn index_codebase(&self, ctx: &StepContext<'_>) -> DomainResult<CodebaseIndex>;

    async fn generate_plan(&self, ctx: &StepContext<'_>) -> DomainResult<ImplementationPlan>;

    /// Split the plan into tasks, requesting collaborations for tasks that need them.
    async fn break_down_tasks(&self, ctx: &StepContext<'_>) -> DomainResult<TaskBreakdown>;

    /// Produce the artifact for one task.
    async fn execute_task(&self, ctx: &StepContext<'_>, task: &PlannedTask)
        -> DomainResult<FileChange>;

    async fn final_review(
        &self,
        ctx: &StepContext<'_>,
        execution: &ExecutionSummary,
    ) -> DomainResult<ReviewOutcome>;
}

/// Branch-safe form of a ticket reference.
pub fn slugify(reference: &str) -> String {
    let mut slug = String::with_capacity(reference.len());
    for c in reference.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// Parse task lines (`- x`, `* x`, `1. x`, `2) x`) out of a completion.
pub fn parse_task_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
                return Some(rest.trim().to_string());
            }
            let digits = line.chars().take_while(char::is_ascii_digit).count();
            if digits == 0 {
                return None;
            }
            line[digits..]
                .strip_prefix(". ")
                .or_else(|| line[digits..].strip_prefix(") "))
                .map(|rest| rest.trim().to_string())
        })
        .filter(|title| !title.is_empty())
        .collect()
}

/// Artifact a task needs from another role, judged from its wording.
pub fn detect_collaboration(title: &str) -> Option<CollaborationType> {
    let lower = title.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has = |candidates: &[&str]| words.iter().any(|w| candidates.contains(w));

    if has(&["api", "interface", "endpoint", "endpoints", "contract"]) {
        Some(CollaborationType::InterfaceContract)
    } else if has(&["ui", "frontend", "screen", "page", "component"]) {
        Some(CollaborationType::UiSpecification)
    } else if has(&["database", "schema", "model", "table", "migration"]) {
        Some(CollaborationType::DataModelSpecification)
    } else {
        None
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .trim_start_matches('#')
        .trim()
        .to_string()
}

/// Walk `root` and count files per extension.
pub fn index_directory(root: &Path) -> DomainResult<CodebaseIndex> {
    let mut extensions: BTreeMap<String, usize> = BTreeMap::new();
    let mut paths = Vec::new();

    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        e.depth() == 0 || !(e.file_type().is_dir() && SKIPPED_DIRS.iter().any(|d| *d == name))
    });
    for entry in walker {
        let entry = entry.map_err(|e| DomainError::ValidationFailed(format!("index failed: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        *extensions.entry(ext).or_default() += 1;
        if let Ok(rel) = entry.path().strip_prefix(root) {
            paths.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }

    paths.sort();
    let file_count = paths.len();
    paths.truncate(SAMPLE_PATHS);
    Ok(CodebaseIndex {
        root: Some(root.display().to_string()),
        file_count,
        extensions,
        sample_paths: paths,
    })
}

fn render_index(index: &CodebaseIndex) -> String {
    if index.file_count == 0 {
        return "No workspace indexed.".to_string();
    }
    let mut out = format!("{} files\n", index.file_count);
    for (ext, count) in &index.extensions {
        let ext = if ext.is_empty() { "(none)" } else { ext.as_str() };
        out.push_str(&format!("  .{ext}: {count}\n"));
    }
    out.push_str("Sample paths:\n");
    for path in &index.sample_paths {
        out.push_str(&format!("  {path}\n"));
    }
    out
}

pub struct LlmPipelineAgents {
    completions: Arc<CompletionService>,
    ticketing: Arc<dyn TicketingClient>,
    source_control: Arc<dyn SourceControlClient>,
    workspace_root: Option<PathBuf>,
    base_branch: String,
}

impl LlmPipelineAgents {
    pub fn new(
        completions: Arc<CompletionService>,
        ticketing: Arc<dyn TicketingClient>,
        source_control: Arc<dyn SourceControlClient>,
    ) -> Self {
        Self {
            completions,
            ticketing,
            source_control,
            workspace_root: None,
            base_branch: "main".to_string(),
        }
    }

    #[must_use]
    pub fn with_workspace_root(mut self, root: Option<PathBuf>) -> Self {
        self.workspace_root = root;
        self
    }

    #[must_use]
    pub fn with_base_branch(mut self, branch: impl Into<String>) -> Self {
        self.base_branch = branch.into();
        self
    }

    async fn ask(
        &self,
        ctx: &StepContext<'_>,
        agent: AgentRole,
        step: PipelineStep,
        prompt: Prompt,
    ) -> DomainResult<String> {
        let outcome = self
            .completions
            .complete(CompletionRequest::new(ctx.run.id, agent, step, prompt))
            .await?;
        Ok(outcome.content)
    }

    fn ticket_section(ctx: &StepContext<'_>) -> PromptSection {
        match ctx.log.ticket_analysis() {
            Some(t) => PromptSection::shrinkable("ticket", format!("{}\n\n{}", t.title, t.summary)),
            None => PromptSection::fixed("ticket", ctx.run.ticket_ref.clone()),
        }
    }

    fn plan_section(ctx: &StepContext<'_>) -> PromptSection {
        let plan = ctx
            .log
            .plan()
            .map(|p| p.content.clone())
            .unwrap_or_else(|| "No plan was produced.".to_string());
        PromptSection::shrinkable("plan", plan)
    }

    /// Source-control half of the final review. Failures are reported, not raised.
    async fn publish_changes(
        &self,
        ctx: &StepContext<'_>,
        artifacts: &[FileChange],
        review: &mut ReviewOutcome,
    ) {
        if artifacts.is_empty() {
            return;
        }
        let branch = format!("foreman/{}", slugify(&ctx.run.ticket_ref));
        let title = ctx
            .log
            .ticket_analysis()
            .map(|t| t.title.clone())
            .unwrap_or_else(|| ctx.run.ticket_ref.clone());

        let result: DomainResult<()> = async {
            self.source_control
                .create_branch(&branch, &self.base_branch)
                .await?;
            self.source_control
                .commit_files(&branch, artifacts, &format!("foreman: {title}"))
                .await?;
            let pr = self
                .source_control
                .create_pull_request(
                    &branch,
                    &self.base_branch,
                    &format!("[foreman] {title}"),
                    &review.summary,
                )
                .await?;
            review.pull_request = Some(pr);
            review.check_runs = self.source_control.list_check_runs(&branch).await?;
            Ok(())
        }
        .await;

        review.branch = Some(branch);
        if let Err(e) = result {
            tracing::warn!(run_id = %ctx.run.id, error = %e, "source control failed during final review");
            review.source_control_error = Some(e.to_string());
        }
    }
}

#[async_trait]
impl PipelineAgents for LlmPipelineAgents {
    async fn retrieve_ticket(&self, ctx: &StepContext<'_>) -> DomainResult<TicketAnalysis> {
        let ticket = self.ticketing.get_ticket(&ctx.run.ticket_ref).await?;
        let prompt = Prompt::new()
            .with(PromptSection::fixed(
                "instructions",
                "You are the planner. Summarize this ticket: the goal, the constraints and what done looks like.",
            ))
            .with(PromptSection::shrinkable(
                "ticket",
                format!("{}\n\n{}", ticket.title, ticket.description),
            ));
        let summary = self
            .ask(ctx, AgentRole::Planner, PipelineStep::RetrieveTicket, prompt)
            .await?;

        Ok(TicketAnalysis {
            placeholder: ticket.is_placeholder(),
            ticket_id: ticket.id,
            title: ticket.title,
            summary,
        })
    }

    async fn index_codebase(&self, _ctx: &StepContext<'_>) -> DomainResult<CodebaseIndex> {
        let Some(root) = self.workspace_root.clone() else {
            return Ok(CodebaseIndex::default());
        };
        tokio::task::spawn_blocking(move || index_directory(&root))
            .await
            .map_err(|e| DomainError::ValidationFailed(format!("index task failed: {e}")))?
    }

    async fn generate_plan(&self, ctx: &StepContext<'_>) -> DomainResult<ImplementationPlan> {
        let index = ctx.log.codebase_index().cloned().unwrap_or_default();
        let prompt = Prompt::new()
            .with(PromptSection::fixed(
                "instructions",
                "You are the architect. Write an implementation plan for the ticket against this codebase.",
            ))
            .with(Self::ticket_section(ctx))
            .with(PromptSection::shrinkable("codebase", render_index(&index)));
        let content = self
            .ask(ctx, AgentRole::Architect, PipelineStep::GeneratePlan, prompt)
            .await?;

        Ok(ImplementationPlan {
            summary: first_line(&content),
            content,
        })
    }

    async fn break_down_tasks(&self, ctx: &StepContext<'_>) -> DomainResult<TaskBreakdown> {
        let prompt = Prompt::new()
            .with(PromptSection::fixed(
                "instructions",
                "You are the planner. List the implementation tasks for this plan, one per line, each starting with \"- \".",
            ))
            .with(Self::plan_section(ctx));
        let content = self
            .ask(ctx, AgentRole::Planner, PipelineStep::BreakDownTasks, prompt)
            .await?;

        let mut titles = parse_task_lines(&content);
        if titles.is_empty() {
            let fallback = ctx
                .log
                .plan()
                .map(|p| p.summary.clone())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("Implement {}", ctx.run.ticket_ref));
            titles.push(fallback);
        }

        let mut tasks = Vec::with_capacity(titles.len());
        for (i, title) in titles.into_iter().enumerate() {
            let task = PlannedTask {
                id: format!("task-{}", i + 1),
                needs: detect_collaboration(&title),
                title,
            };
            if let Some(kind) = task.needs {
                ctx.router
                    .request_collaboration(
                        AgentRole::Planner,
                        kind.default_target(),
                        kind,
                        serde_json::json!({ "task_id": task.id, "title": task.title }),
                    )
                    .await;
            }
            tasks.push(task);
        }
        Ok(TaskBreakdown { tasks })
    }

    async fn execute_task(
        &self,
        ctx: &StepContext<'_>,
        task: &PlannedTask,
    ) -> DomainResult<FileChange> {
        let mut prompt = Prompt::new()
            .with(PromptSection::fixed(
                "instructions",
                "You are the implementer. Produce the change for this task as a single file body.",
            ))
            .with(PromptSection::fixed("task", format!("{}: {}", task.id, task.title)))
            .with(Self::plan_section(ctx));

        let (collaborations, _) = ctx.router.snapshot().await;
        for collab in collaborations.iter().filter(|c| {
            c.status == HandoffStatus::Completed && c.data["task_id"] == task.id.as_str()
        }) {
            let artifact = collab
                .result
                .as_ref()
                .and_then(|r| r["artifact"].as_str())
                .unwrap_or_default();
            prompt.push(PromptSection::shrinkable(collab.kind.as_str(), artifact));
        }

        let content = self
            .ask(ctx, AgentRole::Implementer, PipelineStep::ExecuteTasks, prompt)
            .await?;
        Ok(FileChange {
            path: format!("foreman/{}/{}.md", slugify(&ctx.run.ticket_ref), task.id),
            content,
        })
    }

    async fn final_review(
        &self,
        ctx: &StepContext<'_>,
        execution: &ExecutionSummary,
    ) -> DomainResult<ReviewOutcome> {
        let artifacts = execution.artifacts();
        let changes = artifacts
            .iter()
            .map(|a| format!("### {}\n{}", a.path, a.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let outcomes = execution
            .outcomes
            .iter()
            .map(|o| format!("- {} {}: {:?}", o.task_id, o.title, o.status))
            .collect::<Vec<_>>()
            .join("\n");

        let test_prompt = Prompt::new()
            .with(PromptSection::fixed(
                "instructions",
                "You are the tester. Describe how these changes should be tested and any defects you see.",
            ))
            .with(PromptSection::fixed("outcomes", outcomes.clone()))
            .with(PromptSection::shrinkable("changes", changes.clone()));
        let test_report = self
            .ask(ctx, AgentRole::Tester, PipelineStep::FinalReview, test_prompt)
            .await?;

        let review_prompt = Prompt::new()
            .with(PromptSection::fixed(
                "instructions",
                "You are the reviewer. Review the changes against the ticket. Reply APPROVED or CHANGES REQUESTED, then explain.",
            ))
            .with(Self::ticket_section(ctx))
            .with(PromptSection::fixed("outcomes", outcomes))
            .with(PromptSection::shrinkable("test_report", test_report.clone()))
            .with(PromptSection::shrinkable("changes", changes));
        let summary = self
            .ask(ctx, AgentRole::Reviewer, PipelineStep::FinalReview, review_prompt)
            .await?;

        let verdict = if summary.to_uppercase().contains("CHANGES REQUESTED") {
            ReviewVerdict::ChangesRequested
        } else {
            ReviewVerdict::Approved
        };

        let mut review = ReviewOutcome {
            verdict,
            summary,
            test_report,
            branch: None,
            pull_request: None,
            check_runs: Vec::new(),
            source_control_error: None,
        };
        self.publish_changes(ctx, &artifacts, &mut review).await;
        Ok(review)
    }
}

/// Answers collaborations by asking the target role for the artifact.
pub struct AgentCollaborationHandler {
    completions: Arc<CompletionService>,
}

impl AgentCollaborationHandler {
    pub fn new(completions: Arc<CompletionService>) -> Self {
        Self { completions }
    }
}

#[async_trait]
impl CollaborationHandler for AgentCollaborationHandler {
    async fn handle(&self, collaboration: &Collaboration) -> Result<serde_json::Value, String> {
        let title = collaboration.data["title"].as_str().unwrap_or_default();
        let prompt = Prompt::new()
            .with(PromptSection::fixed(
                "instructions",
                format!(
                    "You are the {}. The {} needs a {} for the task below. Write it.",
                    collaboration.to,
                    collaboration.from,
                    collaboration.kind.as_str().replace('_', " ")
                ),
            ))
            .with(PromptSection::shrinkable("task", title));
        let outcome = self
            .completions
            .complete(CompletionRequest::new(
                collaboration.run_id,
                collaboration.to,
                PipelineStep::DrainCollaborations,
                prompt,
            ))
            .await
            .map_err(|e| e.to_string())?;
        Ok(serde_json::json!({
            "artifact": outcome.content,
            "call_id": outcome.call.id,
        }))
    }
}

/// Answers escalations by asking the target role for guidance.
pub struct AgentEscalationHandler {
    completions: Arc<CompletionService>,
}

impl AgentEscalationHandler {
    pub fn new(completions: Arc<CompletionService>) -> Self {
        Self { completions }
    }
}

#[async_trait]
impl EscalationHandler for AgentEscalationHandler {
    async fn handle(&self, escalation: &Escalation) -> Result<serde_json::Value, String> {
        let step = escalation.context["step"]
            .as_str()
            .and_then(PipelineStep::from_str)
            .unwrap_or(PipelineStep::DrainCollaborations);
        let prompt = Prompt::new()
            .with(PromptSection::fixed(
                "instructions",
                format!(
                    "You are the {}. The {} escalated a problem to you. Advise how to proceed.",
                    escalation.to, escalation.from
                ),
            ))
            .with(PromptSection::fixed("reason", escalation.reason.clone()))
            .with(PromptSection::shrinkable(
                "context",
                serde_json::to_string_pretty(&escalation.context).unwrap_or_default(),
            ));
        let outcome = self
            .completions
            .complete(CompletionRequest::new(
                escalation.run_id,
                escalation.to,
                step,
                prompt,
            ))
            .await
            .map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "guidance": outcome.content }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("T-1"), "t-1");
        assert_eq!(slugify("acme/shop#42"), "acme-shop-42");
        assert_eq!(slugify("--Weird  Ref--"), "weird-ref");
    }

    #[test]
    fn test_parse_task_lines() {
        let text = "Here is the breakdown:\n- Add login endpoint\n* Write tests\n3. Update docs\n4) Ship it\nThanks";
        assert_eq!(
            parse_task_lines(text),
            vec!["Add login endpoint", "Write tests", "Update docs", "Ship it"]
        );
        assert!(parse_task_lines("Nothing to do.").is_empty());
        assert!(parse_task_lines("2024 was a year").is_empty());
    }

    #[test]
    fn test_detect_collaboration_uses_whole_words() {
        assert_eq!(
            detect_collaboration("Add login API endpoint"),
            Some(CollaborationType::InterfaceContract)
        );
        assert_eq!(
            detect_collaboration("Build the settings screen"),
            Some(CollaborationType::UiSpecification)
        );
        assert_eq!(
            detect_collaboration("Add users table migration"),
            Some(CollaborationType::DataModelSpecification)
        );
        // "build" contains "ui" but is not the word "ui"
        assert_eq!(detect_collaboration("Build release artifacts"), None);
    }

    #[test]
    fn test_index_directory_skips_vcs_and_counts_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(dir.path().join("Makefile"), "").unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();

        let index = index_directory(dir.path()).unwrap();
        assert_eq!(index.file_count, 3);
        assert_eq!(index.extensions.get("rs"), Some(&2));
        assert_eq!(index.extensions.get(""), Some(&1));
        assert_eq!(
            index.sample_paths,
            vec!["Makefile", "src/lib.rs", "src/main.rs"]
        );
    }

    #[test]
    fn test_first_line_strips_heading() {
        assert_eq!(first_line("\n# Plan: add login\n1. x"), "Plan: add login");
        assert_eq!(first_line(""), "");
    }
}
