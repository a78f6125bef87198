//! The GitHub capability the review flow runs against.
//!
//! `GitHubOperations` is scoped to one installation. The REST implementation
//! lives in [`crate::github`]; tests use an in-memory fake.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatekeeper_core::{CheckStatus, GitRef, MergeCapabilities, MergeMethod, PrComment};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `owner/name`.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub head: GitRef,
    #[serde(default)]
    pub base: GitRef,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged: bool,
}

impl PullRequest {
    pub fn is_closed(&self) -> bool {
        self.state == "closed" || self.merged
    }

    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }
}

fn default_branch_name() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub owner: User,
    #[serde(default = "default_branch_name")]
    pub default_branch: String,
    #[serde(default)]
    pub allow_merge_commit: bool,
    #[serde(default)]
    pub allow_rebase_merge: bool,
    #[serde(default)]
    pub allow_squash_merge: bool,
    #[serde(default)]
    pub archived: bool,
}

impl Repository {
    pub fn repo_ref(&self) -> RepoRef {
        RepoRef::new(&self.owner.login, &self.name)
    }

    /// Queue key: one review at a time per repository.
    pub fn key(&self) -> String {
        self.repo_ref().to_string()
    }

    pub fn merge_capabilities(&self) -> MergeCapabilities {
        MergeCapabilities {
            allow_merge_commit: self.allow_merge_commit,
            allow_rebase_merge: self.allow_rebase_merge,
            allow_squash_merge: self.allow_squash_merge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Comparison {
    pub status: String,
    #[serde(default)]
    pub ahead_by: u32,
    #[serde(default)]
    pub behind_by: u32,
}

impl Comparison {
    /// The head is missing commits from the base.
    pub fn is_out_of_date(&self) -> bool {
        self.status == "behind" || self.status == "diverged"
    }
}

/// Non-success response from the GitHub API.
#[derive(Debug, Clone, thiserror::Error)]
#[error("GitHub API error: {status} - {body}")]
pub struct ApiError {
    pub status: u16,
    pub body: String,
}

impl ApiError {
    /// 405 and 409 from the merge endpoint mean GitHub refused the merge.
    pub fn is_merge_refusal(&self) -> bool {
        self.status == 405 || self.status == 409
    }
}

/// Per-event metadata carried alongside a review request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    pub event: String,
    pub action: String,
    #[serde(default)]
    pub delivery_id: Option<String>,
    #[serde(default)]
    pub installation_id: Option<u64>,
    #[serde(default)]
    pub sender: Option<String>,
}

#[async_trait]
pub trait GitHubOperations: Send + Sync {
    async fn get_pull_request(&self, repo: &RepoRef, number: u64) -> Result<PullRequest>;

    async fn get_repository(&self, repo: &RepoRef) -> Result<Repository>;

    /// Commit statuses and check runs for a branch name or commit SHA.
    async fn list_statuses(&self, repo: &RepoRef, git_ref: &str) -> Result<Vec<CheckStatus>>;

    async fn list_comments(&self, repo: &RepoRef, number: u64) -> Result<Vec<PrComment>>;

    async fn add_comment(&self, repo: &RepoRef, number: u64, body: &str) -> Result<()>;

    async fn compare(&self, repo: &RepoRef, base: &str, head: &str) -> Result<Comparison>;

    async fn request_branch_update(
        &self,
        repo: &RepoRef,
        number: u64,
        expected_head_sha: &str,
    ) -> Result<()>;

    async fn approve(&self, repo: &RepoRef, number: u64) -> Result<()>;

    /// `None` lets GitHub use the repository default.
    async fn merge(&self, repo: &RepoRef, number: u64, method: Option<MergeMethod>) -> Result<()>;
}

/// Produces the operations handle for the installation an event came from.
pub trait GitHubConnector: Send + Sync {
    fn connect(&self, meta: &EventMeta) -> Arc<dyn GitHubOperations>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_ref_parse() {
        assert_eq!(RepoRef::parse("octo/hello"), Some(RepoRef::new("octo", "hello")));
        assert_eq!(RepoRef::parse("octo"), None);
        assert_eq!(RepoRef::parse("/hello"), None);
        assert_eq!(RepoRef::parse("a/b/c"), None);
        assert_eq!(RepoRef::new("octo", "hello").to_string(), "octo/hello");
    }

    #[test]
    fn test_pull_request_from_webhook_json() {
        let json = r#"{
            "number": 42,
            "state": "open",
            "user": {"login": "dependabot[bot]", "id": 1},
            "labels": [{"name": "dependencies", "color": "fff"}],
            "head": {"ref": "dependabot/cargo/serde", "sha": "abc", "label": "x"},
            "base": {"ref": "main", "sha": "def"},
            "created_at": "2024-05-01T12:00:00Z",
            "merged": false,
            "title": "Bump serde"
        }"#;
        let pr: PullRequest = serde_json::from_str(json).unwrap();
        assert_eq!(pr.number, 42);
        assert!(!pr.is_closed());
        assert_eq!(pr.label_names(), vec!["dependencies"]);
        assert_eq!(pr.head.ref_name, "dependabot/cargo/serde");
    }

    #[test]
    fn test_minimal_pull_request_payload() {
        let pr: PullRequest = serde_json::from_str(r#"{"number": 7}"#).unwrap();
        assert_eq!(pr.number, 7);
        assert!(pr.head.ref_name.is_empty());
    }

    #[test]
    fn test_merged_pull_request_counts_as_closed() {
        let pr = PullRequest {
            number: 1,
            state: "open".to_string(),
            merged: true,
            ..Default::default()
        };
        assert!(pr.is_closed());
    }

    #[test]
    fn test_repository_defaults() {
        let repo: Repository =
            serde_json::from_str(r#"{"name": "hello", "owner": {"login": "octo"}}"#).unwrap();
        assert_eq!(repo.default_branch, "main");
        assert_eq!(repo.key(), "octo/hello");
        assert_eq!(repo.merge_capabilities(), MergeCapabilities::default());
    }

    #[test]
    fn test_comparison_out_of_date() {
        let cmp = |status: &str| Comparison {
            status: status.to_string(),
            ahead_by: 0,
            behind_by: 0,
        };
        assert!(cmp("behind").is_out_of_date());
        assert!(cmp("diverged").is_out_of_date());
        assert!(!cmp("ahead").is_out_of_date());
        assert!(!cmp("identical").is_out_of_date());
    }

    #[test]
    fn test_api_error_display_and_merge_refusal() {
        let err = ApiError {
            status: 405,
            body: "Pull Request is not mergeable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "GitHub API error: 405 - Pull Request is not mergeable"
        );
        assert!(err.is_merge_refusal());
        assert!(!ApiError {
            status: 502,
            body: String::new()
        }
        .is_merge_refusal());
    }
}
