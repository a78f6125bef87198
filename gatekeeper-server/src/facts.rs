use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatekeeper_core::{CheckStatus, GitRef, PrComment, PullRequestFacts};

use crate::operations::{GitHubOperations, PullRequest, RepoRef};

/// Facts about a pull request backed by the GitHub API.
///
/// Static attributes come from the fetched pull request; comments and
/// statuses are requested only when a check asks for them.
pub struct LivePullRequest<'a> {
    ops: &'a dyn GitHubOperations,
    repo: &'a RepoRef,
    pr: &'a PullRequest,
    labels: Vec<String>,
}

impl<'a> LivePullRequest<'a> {
    pub fn new(ops: &'a dyn GitHubOperations, repo: &'a RepoRef, pr: &'a PullRequest) -> Self {
        Self {
            ops,
            repo,
            pr,
            labels: pr.label_names(),
        }
    }
}

#[async_trait]
impl PullRequestFacts for LivePullRequest<'_> {
    fn author(&self) -> &str {
        &self.pr.user.login
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn head(&self) -> &GitRef {
        &self.pr.head
    }

    fn base(&self) -> &GitRef {
        &self.pr.base
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.pr.created_at
    }

    async fn comments(&self) -> Result<Vec<PrComment>> {
        self.ops.list_comments(self.repo, self.pr.number).await
    }

    async fn checks(&self) -> Result<Vec<CheckStatus>> {
        self.ops.list_statuses(self.repo, &self.pr.head.sha).await
    }
}
