//! Pull request snapshots loaded from JSON.
//!
//! Used by tests and by `gatekeeper check` to evaluate a policy without
//! talking to GitHub. Fetch failures can be simulated with `comments_error`
//! and `checks_error`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::facts::{CheckState, CheckStatus, GitRef, PrComment, PullRequestFacts};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixturePullRequest {
    pub author: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub head: GitRef,
    #[serde(default)]
    pub base: GitRef,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comments: Vec<PrComment>,
    #[serde(default)]
    pub checks: Vec<CheckStatus>,
    #[serde(default)]
    pub comments_error: Option<String>,
    #[serde(default)]
    pub checks_error: Option<String>,
}

impl FixturePullRequest {
    pub fn new(author: impl Into<String>, head_ref: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            head: GitRef::new(head_ref, "0000000000000000000000000000000000000001"),
            base: GitRef::new("main", "0000000000000000000000000000000000000000"),
            ..Default::default()
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse pull request fixture")
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_comment(mut self, author: &str, body: &str) -> Self {
        self.comments.push(PrComment {
            author: author.to_string(),
            body: body.to_string(),
        });
        self
    }

    pub fn with_check(mut self, name: &str, state: CheckState) -> Self {
        self.checks.push(CheckStatus::new(name, state));
        self
    }

    pub fn with_comments_error(mut self, message: &str) -> Self {
        self.comments_error = Some(message.to_string());
        self
    }

    pub fn with_checks_error(mut self, message: &str) -> Self {
        self.checks_error = Some(message.to_string());
        self
    }
}

#[async_trait]
impl PullRequestFacts for FixturePullRequest {
    fn author(&self) -> &str {
        &self.author
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn head(&self) -> &GitRef {
        &self.head
    }

    fn base(&self) -> &GitRef {
        &self.base
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    async fn comments(&self) -> Result<Vec<PrComment>> {
        match &self.comments_error {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(self.comments.clone()),
        }
    }

    async fn checks(&self) -> Result<Vec<CheckStatus>> {
        match &self.checks_error {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(self.checks.clone()),
        }
    }
}
