//! What the validator needs to know about a pull request.
//!
//! `PullRequestFacts` is implemented by the server over live GitHub data and
//! by [`FixturePullRequest`](crate::fixture::FixturePullRequest) over recorded
//! JSON, so the same evaluation runs in production, tests and the CLI.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
    #[serde(default)]
    pub sha: String,
}

impl GitRef {
    pub fn new(ref_name: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            ref_name: ref_name.into(),
            sha: sha.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrComment {
    #[serde(default)]
    pub author: String,
    pub body: String,
}

/// A commit status or check-run outcome, normalized to one vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    // Terminal, passing
    Success,
    Neutral,
    Skipped,
    Completed,

    // Terminal, failing
    Failure,
    Error,
    Cancelled,
    TimedOut,
    ActionRequired,
    Stale,
    StartupFailure,

    // Still running
    Pending,
    Queued,
    InProgress,
    Waiting,
    Requested,

    #[serde(other)]
    Unknown,
}

impl CheckState {
    pub fn is_terminal_pass(&self) -> bool {
        matches!(
            self,
            CheckState::Success | CheckState::Neutral | CheckState::Skipped | CheckState::Completed
        )
    }

    /// Unrecognized states count as terminal so that waits do not spin on them.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            CheckState::Pending
                | CheckState::Queued
                | CheckState::InProgress
                | CheckState::Waiting
                | CheckState::Requested
        )
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckState::Success => "success",
            CheckState::Neutral => "neutral",
            CheckState::Skipped => "skipped",
            CheckState::Completed => "completed",
            CheckState::Failure => "failure",
            CheckState::Error => "error",
            CheckState::Cancelled => "cancelled",
            CheckState::TimedOut => "timed_out",
            CheckState::ActionRequired => "action_required",
            CheckState::Stale => "stale",
            CheckState::StartupFailure => "startup_failure",
            CheckState::Pending => "pending",
            CheckState::Queued => "queued",
            CheckState::InProgress => "in_progress",
            CheckState::Waiting => "waiting",
            CheckState::Requested => "requested",
            CheckState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub name: String,
    pub state: CheckState,
}

impl CheckStatus {
    pub fn new(name: impl Into<String>, state: CheckState) -> Self {
        Self {
            name: name.into(),
            state,
        }
    }
}

/// Aggregate state of every check reported for a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinedState {
    Pending,
    Success,
    Failure,
}

/// Pending while anything is still running, otherwise failure if any
/// finished check did not pass. A commit without checks counts as success.
pub fn combined_state(statuses: &[CheckStatus]) -> CombinedState {
    if statuses.iter().any(|s| !s.state.is_terminal()) {
        CombinedState::Pending
    } else if statuses.iter().any(|s| !s.state.is_terminal_pass()) {
        CombinedState::Failure
    } else {
        CombinedState::Success
    }
}

#[async_trait]
pub trait PullRequestFacts: Send + Sync {
    /// Login of the pull request author.
    fn author(&self) -> &str;
    fn labels(&self) -> &[String];
    fn head(&self) -> &GitRef;
    fn base(&self) -> &GitRef;
    fn created_at(&self) -> Option<DateTime<Utc>>;

    async fn comments(&self) -> Result<Vec<PrComment>>;

    /// Statuses and check runs reported for the head commit.
    async fn checks(&self) -> Result<Vec<CheckStatus>>;
}
