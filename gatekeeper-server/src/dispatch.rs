use anyhow::{anyhow, Result};
use gatekeeper_core::PolicyConfig;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::operations::{EventMeta, PullRequest, Repository};
use crate::queue::{EventEnvelope, RepositoryEventQueue};
use crate::review::{ReviewOrchestrator, ReviewOutcome};

/// How accepted events reach the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReviewerMode {
    /// Review inline in the caller's task.
    Direct,
    /// Hand off to the per-repository queue.
    #[default]
    Queue,
}

impl FromStr for ReviewerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ReviewerMode::Direct),
            "queue" => Ok(ReviewerMode::Queue),
            other => Err(anyhow!("Unknown reviewer type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Closed,
    ApproveDisabled,
    NoMatchingBranch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Skipped(SkipReason),
    Queued,
    Reviewed(ReviewOutcome),
}

/// Cheap checks that avoid starting a review that cannot succeed.
pub fn skip_reason(pr: &PullRequest, policy: &PolicyConfig) -> Option<SkipReason> {
    if pr.is_closed() {
        return Some(SkipReason::Closed);
    }
    let Some(include) = policy.approve_include() else {
        return Some(SkipReason::ApproveDisabled);
    };
    let head_ref = &pr.head.ref_name;
    if !include.branches.is_empty()
        && !include
            .branches
            .values()
            .any(|rule| head_ref.starts_with(&rule.prefix))
    {
        return Some(SkipReason::NoMatchingBranch);
    }
    None
}

pub struct ReviewDispatcher {
    orchestrator: Arc<ReviewOrchestrator>,
    queue: RepositoryEventQueue,
    mode: ReviewerMode,
}

impl ReviewDispatcher {
    pub fn new(
        orchestrator: Arc<ReviewOrchestrator>,
        queue: RepositoryEventQueue,
        mode: ReviewerMode,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            mode,
        }
    }

    pub fn queue(&self) -> &RepositoryEventQueue {
        &self.queue
    }

    pub async fn handle(
        &self,
        pr: PullRequest,
        repository: Repository,
        policy: PolicyConfig,
        meta: EventMeta,
    ) -> Result<Dispatched> {
        if let Some(reason) = skip_reason(&pr, &policy) {
            info!(
                "Skipping PR #{} in {}: {:?}",
                pr.number,
                repository.key(),
                reason
            );
            return Ok(Dispatched::Skipped(reason));
        }

        match self.mode {
            ReviewerMode::Direct => {
                let outcome = self
                    .orchestrator
                    .review(&pr, &repository, &policy, &meta)
                    .await?;
                Ok(Dispatched::Reviewed(outcome))
            }
            ReviewerMode::Queue => {
                debug!("Queueing PR #{} in {}", pr.number, repository.key());
                self.queue.enqueue(EventEnvelope {
                    pull_request: pr,
                    repository,
                    policy,
                    meta,
                    handler: self.orchestrator.clone(),
                })?;
                Ok(Dispatched::Queued)
            }
        }
    }
}
