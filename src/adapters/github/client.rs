//! GitHub HTTP client with rate limiting.
//!
//! Wraps the GitHub REST API v3 for the operations the pipeline needs:
//! reading issues as tickets, and branch / commit / pull request / check-run
//! operations for the final review. Requests share a `governor` quota to stay
//! within the 5 000 req/hour authenticated API limit.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{CheckRun, FileChange, GithubConfig, PullRequest, Ticket};
use crate::domain::ports::{SourceControlClient, TicketingClient};

use super::models::{
    CheckRunList, CreatedPullRequest, GitCommit, GitHubIssue, GitObject, GitRef, TreeEntry,
};

const COLLABORATOR: &str = "github";

fn github_error(message: String) -> DomainError {
    DomainError::collaborator(COLLABORATOR, message)
}

/// HTTP client for the GitHub REST API v3, bound to one repository.
#[derive(Clone)]
pub struct GitHubClient {
    http: Client,
    token: String,
    api_base: String,
    owner: String,
    repo: String,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl GitHubClient {
    pub fn new(
        token: String,
        api_base: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Self {
        let per_hour = NonZeroU32::new(5_000).unwrap_or(NonZeroU32::MIN);
        Self {
            http: Client::new(),
            token,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            repo: repo.into(),
            limiter: Arc::new(RateLimiter::direct(Quota::per_hour(per_hour))),
        }
    }

    /// Build a client from config, reading the token from `config.token_env`.
    pub fn from_config(config: &GithubConfig) -> Result<Self, String> {
        let token = std::env::var(&config.token_env)
            .map_err(|_| format!("{} environment variable is not set", config.token_env))?;
        if token.is_empty() {
            return Err(format!("{} environment variable is empty", config.token_env));
        }
        if config.owner.is_empty() || config.repo.is_empty() {
            return Err("github.owner and github.repo must be set".to_string());
        }
        Ok(Self::new(
            token,
            config.api_base_url.clone(),
            config.owner.clone(),
            config.repo.clone(),
        ))
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_base, self.owner, self.repo, path)
    }

    /// Wait for quota and build an authorized request.
    async fn rate_limited_request(&self, method: Method, url: &str) -> RequestBuilder {
        self.limiter.until_ready().await;
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", "foreman")
    }

    async fn send_json<T: DeserializeOwned>(&self, op: &str, req: RequestBuilder) -> DomainResult<T> {
        let resp = req
            .send()
            .await
            .map_err(|e| github_error(format!("{op} request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(github_error(format!("{op} returned {status}: {body}")));
        }

        resp.json::<T>()
            .await
            .map_err(|e| github_error(format!("{op} parse failed: {e}")))
    }

    async fn head_sha(&self, branch: &str) -> DomainResult<String> {
        let url = self.repo_url(&format!("git/ref/heads/{branch}"));
        let req = self.rate_limited_request(Method::GET, &url).await;
        let git_ref: GitRef = self.send_json("get_ref", req).await?;
        Ok(git_ref.object.sha)
    }

    /// Resolve `owner/repo#42`, `#42` or `42` to an issue number in this repository.
    fn issue_number(&self, ticket_ref: &str) -> DomainResult<u64> {
        let number = match ticket_ref.rsplit_once('#') {
            Some((repo, number)) => {
                let expected = format!("{}/{}", self.owner, self.repo);
                if !repo.is_empty() && repo != expected {
                    return Err(github_error(format!(
                        "ticket {ticket_ref} is not in {expected}"
                    )));
                }
                number
            }
            None => ticket_ref,
        };
        number
            .trim()
            .parse()
            .map_err(|_| github_error(format!("invalid issue reference: {ticket_ref}")))
    }
}

#[async_trait]
impl TicketingClient for GitHubClient {
    async fn get_ticket(&self, id: &str) -> DomainResult<Ticket> {
        let number = self.issue_number(id)?;
        let url = self.repo_url(&format!("issues/{number}"));
        let req = self.rate_limited_request(Method::GET, &url).await;
        let issue: GitHubIssue = self.send_json("get_issue", req).await?;

        let mut fields = BTreeMap::new();
        fields.insert("source".to_string(), "github".to_string());
        fields.insert("state".to_string(), issue.state);
        fields.insert("url".to_string(), issue.html_url);
        if !issue.labels.is_empty() {
            let labels: Vec<_> = issue.labels.into_iter().map(|l| l.name).collect();
            fields.insert("labels".to_string(), labels.join(","));
        }

        Ok(Ticket {
            id: id.to_string(),
            title: issue.title,
            description: issue.body.unwrap_or_default(),
            fields,
        })
    }
}

#[async_trait]
impl SourceControlClient for GitHubClient {
    async fn create_branch(&self, branch: &str, base: &str) -> DomainResult<()> {
        let sha = self.head_sha(base).await?;
        let url = self.repo_url("git/refs");
        let req = self
            .rate_limited_request(Method::POST, &url)
            .await
            .json(&serde_json::json!({ "ref": format!("refs/heads/{branch}"), "sha": sha }));
        let _: GitRef = self.send_json("create_ref", req).await?;
        Ok(())
    }

    async fn commit_files(
        &self,
        branch: &str,
        files: &[FileChange],
        message: &str,
    ) -> DomainResult<String> {
        let parent_sha = self.head_sha(branch).await?;

        let url = self.repo_url(&format!("git/commits/{parent_sha}"));
        let req = self.rate_limited_request(Method::GET, &url).await;
        let parent: GitCommit = self.send_json("get_commit", req).await?;

        let entries: Vec<TreeEntry<'_>> = files
            .iter()
            .map(|f| TreeEntry {
                path: &f.path,
                mode: "100644",
                kind: "blob",
                content: &f.content,
            })
            .collect();
        let url = self.repo_url("git/trees");
        let req = self
            .rate_limited_request(Method::POST, &url)
            .await
            .json(&serde_json::json!({ "base_tree": parent.tree.sha, "tree": entries }));
        let tree: GitObject = self.send_json("create_tree", req).await?;

        let url = self.repo_url("git/commits");
        let req = self
            .rate_limited_request(Method::POST, &url)
            .await
            .json(&serde_json::json!({
                "message": message,
                "tree": tree.sha,
                "parents": [parent.sha],
            }));
        let commit: GitObject = self.send_json("create_commit", req).await?;

        let url = self.repo_url(&format!("git/refs/heads/{branch}"));
        let req = self
            .rate_limited_request(Method::PATCH, &url)
            .await
            .json(&serde_json::json!({ "sha": commit.sha }));
        let _: GitRef = self.send_json("update_ref", req).await?;

        Ok(commit.sha)
    }

    async fn create_pull_request(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> DomainResult<PullRequest> {
        let url = self.repo_url("pulls");
        let req = self
            .rate_limited_request(Method::POST, &url)
            .await
            .json(&serde_json::json!({
                "title": title,
                "body": body,
                "head": branch,
                "base": base,
            }));
        let created: CreatedPullRequest = self.send_json("create_pull_request", req).await?;
        Ok(PullRequest {
            url: created.html_url,
            number: created.number,
        })
    }

    async fn list_check_runs(&self, reference: &str) -> DomainResult<Vec<CheckRun>> {
        let url = self.repo_url(&format!("commits/{reference}/check-runs"));
        let req = self.rate_limited_request(Method::GET, &url).await;
        let list: CheckRunList = self.send_json("list_check_runs", req).await?;
        Ok(list
            .check_runs
            .into_iter()
            .map(|c| CheckRun {
                name: c.name,
                status: c.status,
                conclusion: c.conclusion,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(server: &mockito::Server) -> GitHubClient {
        GitHubClient::new("ghp_test".to_string(), server.url(), "acme", "shop")
    }

    #[tokio::test]
    async fn test_get_ticket_maps_issue() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/acme/shop/issues/42")
            .match_header("authorization", "Bearer ghp_test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"number":42,"title":"Add login","body":"Users need to log in","state":"open","labels":[{"name":"api"}],"html_url":"https://github.com/acme/shop/issues/42"}"#,
            )
            .create_async()
            .await;

        let ticket = client(&server).get_ticket("acme/shop#42").await.unwrap();
        assert_eq!(ticket.title, "Add login");
        assert_eq!(ticket.description, "Users need to log in");
        assert_eq!(ticket.fields.get("labels").map(String::as_str), Some("api"));
        assert!(!ticket.is_placeholder());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_ticket_error_is_collaborator_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/acme/shop/issues/7")
            .with_status(404)
            .with_body("Not Found")
            .create_async()
            .await;

        let err = client(&server).get_ticket("7").await.unwrap_err();
        match err {
            DomainError::Collaborator { collaborator, message } => {
                assert_eq!(collaborator, "github");
                assert!(message.contains("404"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_issue_number_rejects_other_repositories() {
        let c = GitHubClient::new("t".into(), "http://localhost", "acme", "shop");
        assert_eq!(c.issue_number("#5").unwrap(), 5);
        assert_eq!(c.issue_number("12").unwrap(), 12);
        assert!(c.issue_number("other/repo#5").is_err());
        assert!(c.issue_number("T-1").is_err());
    }

    #[tokio::test]
    async fn test_pull_request_and_check_runs() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/repos/acme/shop/pulls")
            .match_body(Matcher::PartialJson(
                serde_json::json!({"head": "foreman/t-1", "base": "main"}),
            ))
            .with_status(201)
            .with_body(r#"{"number":9,"html_url":"https://github.com/acme/shop/pull/9"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/repos/acme/shop/commits/foreman/t-1/check-runs")
            .with_status(200)
            .with_body(r#"{"total_count":1,"check_runs":[{"name":"ci","status":"queued","conclusion":null}]}"#)
            .create_async()
            .await;

        let c = client(&server);
        let pr = c
            .create_pull_request("foreman/t-1", "main", "Title", "Body")
            .await
            .unwrap();
        assert_eq!(pr.number, 9);

        let checks = c.list_check_runs("foreman/t-1").await.unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].name, "ci");
        assert!(checks[0].conclusion.is_none());
    }
}
