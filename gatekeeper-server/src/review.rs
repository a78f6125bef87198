//! The approve-then-merge flow for a single pull request.
//!
//! A review walks a fixed sequence of gates and waits. Policy rejections
//! post a comment explaining which rule failed and end the review
//! successfully; infrastructure failures post a templated error comment and
//! return a [`ReviewError`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use gatekeeper_core::{
    combined_state, resolve_merge_method, Attempt, CheckStatus, CombinedState, MergeMethod,
    PolicyConfig, PolicyValidator, RetryPolicy, ValidationOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::ReviewError;
use crate::facts::LivePullRequest;
use crate::operations::{
    ApiError, EventMeta, GitHubConnector, GitHubOperations, PullRequest, RepoRef, Repository,
};
use crate::queue::{EventEnvelope, EventHandler};
use crate::templates::{log_search_url, render_or_fallback, TemplateRenderer};

pub const MAIN_BRANCH_CHECKS_FAILED: &str = "CI checks on the main branch failed; skipping merge.";
pub const PULL_REQUEST_CHECKS_FAILED: &str = "CI checks on the PR failed; skipping merge.";

const BRANCH_CHECKS_ATTEMPTS: u32 = 10;
const BRANCH_CHECKS_PAUSE: Duration = Duration::from_secs(60);

/// Which gate turned a pull request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    ApproveConditions,
    ApproveCommentsAndChecks,
    MergeConditions,
    MergeCommentsAndChecks,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewOutcome {
    /// The pull request was closed or merged before or during the review.
    Closed,
    Rejected {
        gate: Gate,
        outcome: ValidationOutcome,
    },
    /// Approved; merging is not configured.
    Approved,
    MainBranchChecksFailed,
    PullRequestChecksFailed,
    Merged { method: Option<MergeMethod> },
}

#[derive(Debug, Clone)]
pub struct ReviewSettings {
    pub fail_fast: bool,
    /// Waiting for GitHub to rewrite the head after a branch update.
    pub rebase_wait: RetryPolicy,
    /// Waiting for the head commit's checks to finish before approval.
    pub status_wait: RetryPolicy,
    /// Waiting for the default branch and the head to be green before merge.
    pub branch_checks_wait: RetryPolicy,
    /// Base URL for diagnostic log links in error comments.
    pub log_search_url: Option<String>,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            fail_fast: false,
            rebase_wait: RetryPolicy::unbounded(),
            status_wait: RetryPolicy::unbounded(),
            branch_checks_wait: RetryPolicy::new()
                .with_pause(BRANCH_CHECKS_PAUSE)
                .with_max_wait(BRANCH_CHECKS_PAUSE * (BRANCH_CHECKS_ATTEMPTS + 1))
                .with_max_attempts(BRANCH_CHECKS_ATTEMPTS),
            log_search_url: None,
        }
    }
}

pub struct ReviewOrchestrator {
    connector: Arc<dyn GitHubConnector>,
    templates: Arc<dyn TemplateRenderer>,
    settings: ReviewSettings,
}

impl ReviewOrchestrator {
    pub fn new(
        connector: Arc<dyn GitHubConnector>,
        templates: Arc<dyn TemplateRenderer>,
        settings: ReviewSettings,
    ) -> Self {
        Self {
            connector,
            templates,
            settings,
        }
    }

    pub async fn review(
        &self,
        pr: &PullRequest,
        repository: &Repository,
        policy: &PolicyConfig,
        meta: &EventMeta,
    ) -> Result<ReviewOutcome, ReviewError> {
        let ops = self.connector.connect(meta);
        let run = ReviewRun {
            ops: ops.as_ref(),
            repo: repository.repo_ref(),
            number: pr.number,
            policy,
            settings: &self.settings,
            validator: PolicyValidator::new(self.settings.fail_fast),
        };

        info!(
            "Reviewing PR #{} in {} ({} {})",
            pr.number, run.repo, meta.event, meta.action
        );

        match run.execute().await {
            Ok(outcome) => {
                info!("Review of PR #{} in {} finished: {:?}", pr.number, run.repo, outcome);
                Ok(outcome)
            }
            Err(e) => {
                error!("Review of PR #{} in {} failed: {}", pr.number, run.repo, e);
                self.report(&run, &e).await;
                Err(e)
            }
        }
    }

    /// Post the templated comment for an infrastructure failure.
    async fn report(&self, run: &ReviewRun<'_>, err: &ReviewError) {
        if !run.policy.error_comments_enabled() {
            debug!("Error comments disabled for {}, not reporting", run.repo);
            return;
        }

        let log_url = match &self.settings.log_search_url {
            Some(base) => log_search_url(base, &run.repo, run.number, Utc::now()).unwrap_or_else(
                |e| {
                    warn!("Failed to build log search URL: {:#}", e);
                    String::new()
                },
            ),
            None => String::new(),
        };

        let body = render_or_fallback(
            self.templates.as_ref(),
            err.template_kind(),
            &err.template_data(&log_url),
        );
        if let Err(e) = run.ops.add_comment(&run.repo, run.number, &body).await {
            error!(
                "Failed to post error comment on PR #{} in {}: {:#}",
                run.number, run.repo, e
            );
        }
    }
}

#[async_trait]
impl EventHandler for ReviewOrchestrator {
    async fn handle_event(&self, envelope: &EventEnvelope) -> Result<()> {
        self.review(
            &envelope.pull_request,
            &envelope.repository,
            &envelope.policy,
            &envelope.meta,
        )
        .await?;
        Ok(())
    }
}

/// State for one pass through the review steps.
struct ReviewRun<'a> {
    ops: &'a dyn GitHubOperations,
    repo: RepoRef,
    number: u64,
    policy: &'a PolicyConfig,
    settings: &'a ReviewSettings,
    validator: PolicyValidator,
}

enum Gated {
    Continue,
    Stop(ReviewOutcome),
}

impl ReviewRun<'_> {
    async fn execute(&self) -> Result<ReviewOutcome, ReviewError> {
        let pr = self
            .ops
            .get_pull_request(&self.repo, self.number)
            .await
            .map_err(|e| ReviewError::api("fetch pull request", e))?;
        let repository = self
            .ops
            .get_repository(&self.repo)
            .await
            .map_err(|e| ReviewError::api("fetch repository", e))?;

        if pr.is_closed() {
            info!("PR #{} in {} is closed, nothing to do", self.number, self.repo);
            return Ok(ReviewOutcome::Closed);
        }

        let outcome = {
            let facts = LivePullRequest::new(self.ops, &self.repo, &pr);
            self.validator.evaluate_approve_conditions(&facts, self.policy)
        };
        if let Gated::Stop(outcome) = self.gate(Gate::ApproveConditions, outcome).await? {
            return Ok(outcome);
        }

        let pr = match self.rebase_if_out_of_date(pr, &repository).await? {
            Some(pr) => pr,
            None => return Ok(ReviewOutcome::Closed),
        };

        self.wait_for_status_checks(&pr.head.sha).await?;

        let outcome = {
            let facts = LivePullRequest::new(self.ops, &self.repo, &pr);
            self.validator
                .evaluate_approve_comments_and_checks(&facts, self.policy)
                .await
        };
        if let Gated::Stop(outcome) = self.gate(Gate::ApproveCommentsAndChecks, outcome).await? {
            return Ok(outcome);
        }

        self.ops
            .approve(&self.repo, self.number)
            .await
            .map_err(|e| ReviewError::api("approve", e))?;
        info!("Approved PR #{} in {}", self.number, self.repo);

        if self.policy.no_merge() {
            debug!("Merging not configured for {}", self.repo);
            return Ok(ReviewOutcome::Approved);
        }

        let outcome = {
            let facts = LivePullRequest::new(self.ops, &self.repo, &pr);
            self.validator.evaluate_merge_conditions(&facts, self.policy)
        };
        if let Gated::Stop(outcome) = self.gate(Gate::MergeConditions, outcome).await? {
            return Ok(outcome);
        }

        if !self
            .wait_for_branch_checks("main branch checks", &repository.default_branch)
            .await?
        {
            self.comment(MAIN_BRANCH_CHECKS_FAILED).await?;
            return Ok(ReviewOutcome::MainBranchChecksFailed);
        }

        if !self
            .wait_for_branch_checks("pull request checks", &pr.head.sha)
            .await?
        {
            self.comment(PULL_REQUEST_CHECKS_FAILED).await?;
            return Ok(ReviewOutcome::PullRequestChecksFailed);
        }

        let outcome = {
            let facts = LivePullRequest::new(self.ops, &self.repo, &pr);
            self.validator
                .evaluate_merge_comments_and_checks(&facts, self.policy)
                .await
        };
        if let Gated::Stop(outcome) = self.gate(Gate::MergeCommentsAndChecks, outcome).await? {
            return Ok(outcome);
        }

        let method =
            resolve_merge_method(self.policy.merge_method(), &repository.merge_capabilities());
        if let Err(e) = self.ops.merge(&self.repo, self.number, method).await {
            let refused = e
                .downcast_ref::<ApiError>()
                .map(ApiError::is_merge_refusal)
                .unwrap_or(false);
            return Err(if refused {
                ReviewError::not_mergeable(e)
            } else {
                ReviewError::api("merge", e)
            });
        }

        info!("Merged PR #{} in {}", self.number, self.repo);
        Ok(ReviewOutcome::Merged { method })
    }

    async fn comment(&self, body: &str) -> Result<(), ReviewError> {
        self.ops
            .add_comment(&self.repo, self.number, body)
            .await
            .map_err(|e| ReviewError::api("post comment", e))
    }

    /// Stop with a rejection comment unless `outcome` passed.
    async fn gate(&self, gate: Gate, outcome: ValidationOutcome) -> Result<Gated, ReviewError> {
        if outcome.success {
            debug!("PR #{} in {} passed {:?}", self.number, self.repo, gate);
            return Ok(Gated::Continue);
        }

        info!(
            "PR #{} in {} rejected at {:?} ({} results)",
            self.number,
            self.repo,
            gate,
            outcome.results.len()
        );
        self.comment(&outcome.to_markdown()).await?;
        Ok(Gated::Stop(ReviewOutcome::Rejected { gate, outcome }))
    }

    /// Bring the head up to date with the default branch if it has fallen
    /// behind. Returns the refreshed pull request, or `None` if it closed.
    async fn rebase_if_out_of_date(
        &self,
        pr: PullRequest,
        repository: &Repository,
    ) -> Result<Option<PullRequest>, ReviewError> {
        let comparison = self
            .ops
            .compare(&self.repo, &repository.default_branch, &pr.head.sha)
            .await
            .map_err(|e| ReviewError::api("compare branches", e))?;
        if !comparison.is_out_of_date() {
            return Ok(Some(pr));
        }

        info!(
            "PR #{} in {} is {} {} by {} commits, updating branch",
            self.number,
            self.repo,
            comparison.status,
            repository.default_branch,
            comparison.behind_by
        );
        self.ops
            .request_branch_update(&self.repo, self.number, &pr.head.sha)
            .await
            .map_err(|e| ReviewError::api("update branch", e))?;

        let mut wait = self.settings.rebase_wait.clone();
        let ops = self.ops;
        let repo = &self.repo;
        let number = self.number;
        let old_sha = pr.head.sha.as_str();
        let updated = wait
            .run("rebase", move || async move {
                let fresh = ops.get_pull_request(repo, number).await?;
                if fresh.head.sha != old_sha || fresh.is_closed() {
                    Ok(Attempt::Done(fresh))
                } else {
                    Ok(Attempt::Retry)
                }
            })
            .await
            .map_err(|e| ReviewError::api("rebase", e))?;

        match updated {
            None => Err(ReviewError::retry_exceeded(
                "rebase",
                wait.attempts(),
                wait.elapsed(),
            )),
            Some(fresh) if fresh.is_closed() => {
                info!("PR #{} in {} closed during rebase", self.number, self.repo);
                Ok(None)
            }
            Some(fresh) => {
                info!(
                    "PR #{} in {} updated: {} -> {}",
                    self.number, self.repo, old_sha, fresh.head.sha
                );
                Ok(Some(fresh))
            }
        }
    }

    /// Wait for every check on `sha` to finish and require that all passed.
    async fn wait_for_status_checks(&self, sha: &str) -> Result<(), ReviewError> {
        let mut wait = self.settings.status_wait.clone();
        let ops = self.ops;
        let repo = &self.repo;
        let finished = wait
            .run("status checks", move || async move {
                let statuses = ops.list_statuses(repo, sha).await?;
                match observed_state(&statuses) {
                    CombinedState::Pending => Ok(Attempt::Retry),
                    state => Ok(Attempt::Done((state, statuses))),
                }
            })
            .await
            .map_err(|e| ReviewError::api("status checks", e))?;

        match finished {
            None => Err(ReviewError::retry_exceeded(
                "status checks",
                wait.attempts(),
                wait.elapsed(),
            )),
            Some((CombinedState::Success, _)) => {
                debug!("Status checks passed for {} in {}", sha, self.repo);
                Ok(())
            }
            Some((state, statuses)) => Err(ReviewError::status_check_failed(format!(
                "Combined status for {} is {}. Failing checks: {}",
                sha,
                state_name(state),
                failing_checks(&statuses)
            ))),
        }
    }

    /// Poll `git_ref` until its checks finish. `false` when they failed or
    /// did not finish in time.
    async fn wait_for_branch_checks(
        &self,
        name: &str,
        git_ref: &str,
    ) -> Result<bool, ReviewError> {
        let mut wait = self.settings.branch_checks_wait.clone();
        let ops = self.ops;
        let repo = &self.repo;
        let finished = wait
            .run(name, move || async move {
                let statuses = ops.list_statuses(repo, git_ref).await?;
                match observed_state(&statuses) {
                    CombinedState::Pending => Ok(Attempt::Retry),
                    state => Ok(Attempt::Done(state)),
                }
            })
            .await
            .map_err(|e| ReviewError::api("branch checks", e))?;

        match finished {
            Some(CombinedState::Success) => Ok(true),
            Some(state) => {
                warn!("{} for {} in {}: {}", name, git_ref, self.repo, state_name(state));
                Ok(false)
            }
            None => {
                warn!(
                    "{} for {} in {} did not finish after {} attempts",
                    name,
                    git_ref,
                    self.repo,
                    wait.attempts()
                );
                Ok(false)
            }
        }
    }
}

/// Combined state while waiting on CI. A commit with no checks reported yet
/// is still pending; CI may not have registered them after a push.
fn observed_state(statuses: &[CheckStatus]) -> CombinedState {
    if statuses.is_empty() {
        CombinedState::Pending
    } else {
        combined_state(statuses)
    }
}

fn state_name(state: CombinedState) -> &'static str {
    match state {
        CombinedState::Pending => "pending",
        CombinedState::Success => "success",
        CombinedState::Failure => "failure",
    }
}

fn failing_checks(statuses: &[CheckStatus]) -> String {
    let mut names: Vec<&str> = statuses
        .iter()
        .filter(|s| s.state.is_terminal() && !s.state.is_terminal_pass())
        .map(|s| s.name.as_str())
        .collect();
    names.sort_unstable();
    names.dedup();
    names.join(", ")
}
