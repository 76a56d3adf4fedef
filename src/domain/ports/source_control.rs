//! Source-control host port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{CheckRun, FileChange, PullRequest};

#[async_trait]
pub trait SourceControlClient: Send + Sync {
    /// Create `branch` from `base`.
    async fn create_branch(&self, branch: &str, base: &str) -> DomainResult<()>;

    /// Commit files to a branch, returning the commit reference.
    async fn commit_files(
        &self,
        branch: &str,
        files: &[FileChange],
        message: &str,
    ) -> DomainResult<String>;

    async fn create_pull_request(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> DomainResult<PullRequest>;

    /// Check runs attached to a git reference.
    async fn list_check_runs(&self, reference: &str) -> DomainResult<Vec<CheckRun>>;
}
