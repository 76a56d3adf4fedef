//! In-memory source control used when no host is configured.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{CheckRun, FileChange, PullRequest};
use crate::domain::ports::SourceControlClient;

/// Records branches, commits and pull requests without talking to a host.
#[derive(Debug, Default)]
pub struct NullSourceControl {
    branches: Mutex<HashMap<String, Vec<FileChange>>>,
    next_pr: AtomicU64,
}

impl NullSourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files committed to `branch` so far.
    pub async fn files_on(&self, branch: &str) -> Vec<FileChange> {
        self.branches
            .lock()
            .await
            .get(branch)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SourceControlClient for NullSourceControl {
    async fn create_branch(&self, branch: &str, _base: &str) -> DomainResult<()> {
        self.branches
            .lock()
            .await
            .entry(branch.to_string())
            .or_default();
        Ok(())
    }

    async fn commit_files(
        &self,
        branch: &str,
        files: &[FileChange],
        _message: &str,
    ) -> DomainResult<String> {
        let mut branches = self.branches.lock().await;
        let committed = branches.get_mut(branch).ok_or_else(|| {
            DomainError::collaborator("source_control", format!("unknown branch {branch}"))
        })?;
        committed.extend_from_slice(files);
        Ok(format!("local-{}-{}", branch, committed.len()))
    }

    async fn create_pull_request(
        &self,
        branch: &str,
        _base: &str,
        _title: &str,
        _body: &str,
    ) -> DomainResult<PullRequest> {
        if !self.branches.lock().await.contains_key(branch) {
            return Err(DomainError::collaborator(
                "source_control",
                format!("unknown branch {branch}"),
            ));
        }
        let number = self.next_pr.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PullRequest {
            url: format!("local://pull/{number}"),
            number,
        })
    }

    async fn list_check_runs(&self, _reference: &str) -> DomainResult<Vec<CheckRun>> {
        Ok(Vec::new())
    }
}
