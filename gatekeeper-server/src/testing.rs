//! In-memory GitHub for orchestrator and dispatcher tests.

use anyhow::Result;
use async_trait::async_trait;
use gatekeeper_core::{CheckStatus, GitRef, MergeMethod, PrComment};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::operations::{
    ApiError, Comparison, EventMeta, GitHubConnector, GitHubOperations, PullRequest, RepoRef,
    Repository, User,
};

pub fn pull_request(number: u64, author: &str, head_ref: &str, head_sha: &str) -> PullRequest {
    PullRequest {
        number,
        state: "open".to_string(),
        user: User {
            login: author.to_string(),
        },
        labels: Vec::new(),
        head: GitRef::new(head_ref, head_sha),
        base: GitRef::new("main", "base-sha"),
        created_at: Some(chrono::Utc::now() - chrono::Duration::days(1)),
        merged: false,
    }
}

pub fn repository() -> Repository {
    Repository {
        name: "hello".to_string(),
        full_name: "octo/hello".to_string(),
        owner: User {
            login: "octo".to_string(),
        },
        default_branch: "main".to_string(),
        allow_merge_commit: true,
        allow_rebase_merge: true,
        allow_squash_merge: true,
        archived: false,
    }
}

#[derive(Default)]
struct FakeState {
    /// Successive `get_pull_request` responses; the last one repeats.
    pull_requests: VecDeque<PullRequest>,
    repository: Option<Repository>,
    /// Successive status lists per ref; the last one repeats.
    statuses: HashMap<String, VecDeque<Vec<CheckStatus>>>,
    comments: Vec<PrComment>,
    comparison: Option<String>,
    failures: HashMap<&'static str, u16>,
    calls: Vec<String>,
    posted: Vec<String>,
}

fn next_sticky<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// Scripted `GitHubOperations` that records every call.
pub struct FakeGitHub {
    state: Mutex<FakeState>,
}

impl FakeGitHub {
    pub fn new(pr: PullRequest, repository: Repository) -> Self {
        Self {
            state: Mutex::new(FakeState {
                pull_requests: VecDeque::from([pr]),
                repository: Some(repository),
                ..Default::default()
            }),
        }
    }

    pub fn then_pull_request(mut self, pr: PullRequest) -> Self {
        self.state.get_mut().unwrap().pull_requests.push_back(pr);
        self
    }

    pub fn with_statuses(mut self, git_ref: &str, statuses: Vec<CheckStatus>) -> Self {
        self.state
            .get_mut()
            .unwrap()
            .statuses
            .entry(git_ref.to_string())
            .or_default()
            .push_back(statuses);
        self
    }

    pub fn with_comment(mut self, author: &str, body: &str) -> Self {
        self.state.get_mut().unwrap().comments.push(PrComment {
            author: author.to_string(),
            body: body.to_string(),
        });
        self
    }

    /// Compare status of the default branch against the head.
    pub fn with_comparison(mut self, status: &str) -> Self {
        self.state.get_mut().unwrap().comparison = Some(status.to_string());
        self
    }

    /// Make `operation` fail with an API error of `status`.
    pub fn failing(mut self, operation: &'static str, status: u16) -> Self {
        self.state
            .get_mut()
            .unwrap()
            .failures
            .insert(operation, status);
        self
    }

    pub fn current_pull_request(&self) -> PullRequest {
        self.state.lock().unwrap().pull_requests[0].clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn posted_comments(&self) -> Vec<String> {
        self.state.lock().unwrap().posted.clone()
    }

    fn call(&self, operation: &'static str, description: String) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(description);
        match state.failures.get(operation) {
            Some(status) => Err(ApiError {
                status: *status,
                body: format!("{} failed", operation),
            }
            .into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl GitHubOperations for FakeGitHub {
    async fn get_pull_request(&self, _repo: &RepoRef, number: u64) -> Result<PullRequest> {
        self.call("get_pull_request", format!("get-pr {}", number))?;
        let mut state = self.state.lock().unwrap();
        Ok(next_sticky(&mut state.pull_requests).unwrap_or_default())
    }

    async fn get_repository(&self, repo: &RepoRef) -> Result<Repository> {
        self.call("get_repository", format!("get-repo {}", repo))?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .repository
            .clone()
            .unwrap_or_else(repository))
    }

    async fn list_statuses(&self, _repo: &RepoRef, git_ref: &str) -> Result<Vec<CheckStatus>> {
        self.call("list_statuses", format!("statuses {}", git_ref))?;
        let mut state = self.state.lock().unwrap();
        Ok(state
            .statuses
            .get_mut(git_ref)
            .and_then(next_sticky)
            .unwrap_or_default())
    }

    async fn list_comments(&self, _repo: &RepoRef, number: u64) -> Result<Vec<PrComment>> {
        self.call("list_comments", format!("comments {}", number))?;
        Ok(self.state.lock().unwrap().comments.clone())
    }

    async fn add_comment(&self, _repo: &RepoRef, number: u64, body: &str) -> Result<()> {
        self.call("add_comment", format!("comment {}", number))?;
        self.state.lock().unwrap().posted.push(body.to_string());
        Ok(())
    }

    async fn compare(&self, _repo: &RepoRef, base: &str, head: &str) -> Result<Comparison> {
        self.call("compare", format!("compare {}...{}", base, head))?;
        let status = self
            .state
            .lock()
            .unwrap()
            .comparison
            .clone()
            .unwrap_or_else(|| "identical".to_string());
        Ok(Comparison {
            status,
            ahead_by: 0,
            behind_by: 0,
        })
    }

    async fn request_branch_update(
        &self,
        _repo: &RepoRef,
        number: u64,
        expected_head_sha: &str,
    ) -> Result<()> {
        self.call(
            "request_branch_update",
            format!("update-branch {} {}", number, expected_head_sha),
        )
    }

    async fn approve(&self, _repo: &RepoRef, number: u64) -> Result<()> {
        self.call("approve", format!("approve {}", number))
    }

    async fn merge(&self, _repo: &RepoRef, number: u64, method: Option<MergeMethod>) -> Result<()> {
        let method = method.map(|m| m.as_str()).unwrap_or("default");
        self.call("merge", format!("merge {} {}", number, method))
    }
}

pub struct FakeConnector {
    github: Arc<FakeGitHub>,
    connections: Mutex<Vec<EventMeta>>,
}

impl FakeConnector {
    pub fn new(github: Arc<FakeGitHub>) -> Self {
        Self {
            github,
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn connections(&self) -> Vec<EventMeta> {
        self.connections.lock().unwrap().clone()
    }
}

impl GitHubConnector for FakeConnector {
    fn connect(&self, meta: &EventMeta) -> Arc<dyn GitHubOperations> {
        self.connections.lock().unwrap().push(meta.clone());
        self.github.clone()
    }
}
