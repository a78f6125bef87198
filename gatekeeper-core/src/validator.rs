//! Policy evaluation against a pull request.
//!
//! Evaluation happens on two levels. Global `include` requirements are
//! checked first, then the branch rules whose prefix matches the head
//! branch. The branch level passes as soon as one candidate rule is fully
//! satisfied; if none is, the failures of every candidate are reported.
//!
//! `evaluate_conditions` covers facts known from the pull request itself
//! (author, labels, age). `evaluate_comments_and_checks` covers data that has
//! to be fetched (comments, commit statuses) and is run later, once CI has
//! settled.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::checks::{Check, Fetched};
use crate::facts::{CheckStatus, PrComment, PullRequestFacts};
use crate::policy::{BranchRule, Include, PolicyConfig};
use crate::validation::{PolicyKind, Reason, ValidationOutcome};

/// A branch rule selected for a head branch, paired with its map key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchedBranch<'a> {
    pub key: &'a str,
    pub rule: &'a BranchRule,
}

/// Select the branch rules that apply to `branch_name`.
///
/// Rules are visited in ascending key order. Once a matching strict rule has
/// been seen only the longest matching strict rule is returned; otherwise
/// every matching rule is.
pub fn match_branches<'a>(include: &'a Include, branch_name: &str) -> Vec<MatchedBranch<'a>> {
    let mut found = Vec::new();
    let mut strict_winner: Option<MatchedBranch<'a>> = None;

    for (key, rule) in &include.branches {
        if !branch_name.starts_with(&rule.prefix) {
            continue;
        }
        let candidate = MatchedBranch { key, rule };

        if rule.strict {
            let replaces = strict_winner
                .map(|winner| rule.prefix.len() > winner.rule.prefix.len())
                .unwrap_or(true);
            if replaces {
                strict_winner = Some(candidate);
            }
        } else if strict_winner.is_none() {
            found.push(candidate);
        }
    }

    match strict_winner {
        Some(winner) => vec![winner],
        None => found,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyValidator {
    fail_fast: bool,
    now: Option<DateTime<Utc>>,
}

impl PolicyValidator {
    pub fn new(fail_fast: bool) -> Self {
        Self {
            fail_fast,
            now: None,
        }
    }

    /// Evaluate ages relative to a fixed instant instead of the wall clock.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    pub fn evaluate_conditions(
        &self,
        pr: Option<&dyn PullRequestFacts>,
        include: &Include,
        kind: PolicyKind,
    ) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::new(kind, self.fail_fast);
        let Some(pr) = pr else {
            return outcome;
        };

        let global = [
            Check::Author {
                author: pr.author(),
                allowed: &include.authors,
            },
            Check::Labels {
                present: pr.labels(),
                required: &include.labels,
            },
        ];
        for check in &global {
            if check.validate(None, &mut outcome) && self.fail_fast {
                return outcome.finalize();
            }
        }

        let head_ref = &pr.head().ref_name;
        let candidates = match_branches(include, head_ref);
        if candidates.is_empty() {
            debug!("No branch rule matches {} for {}", head_ref, kind);
            outcome.add_result(Reason::Branch, "Branch not found");
            return outcome.finalize();
        }

        let now = self.now();
        let mut rejected = Vec::new();
        for branch in &candidates {
            let mut branch_outcome = ValidationOutcome::new(kind, self.fail_fast);
            let checks = [
                Check::Author {
                    author: pr.author(),
                    allowed: &branch.rule.authors,
                },
                Check::Labels {
                    present: pr.labels(),
                    required: &branch.rule.labels,
                },
                Check::Age {
                    minimum: branch.rule.age.map(|a| a.as_duration()),
                    created_at: pr.created_at(),
                    now,
                },
            ];
            run_branch_checks(&checks, branch, &mut branch_outcome);

            if !branch_outcome.has_failures() {
                debug!("Branch rule {} satisfies {} conditions", branch.key, kind);
                return outcome.finalize();
            }
            rejected.push(branch_outcome);
        }

        for branch_outcome in rejected {
            outcome.append(branch_outcome);
        }
        outcome.finalize()
    }

    pub async fn evaluate_comments_and_checks(
        &self,
        pr: Option<&dyn PullRequestFacts>,
        include: &Include,
        kind: PolicyKind,
    ) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::new(kind, self.fail_fast);
        let Some(pr) = pr else {
            return outcome;
        };

        let candidates = match_branches(include, &pr.head().ref_name);
        let needs_comments = !include.comments.is_empty()
            || candidates.iter().any(|b| !b.rule.comments.is_empty());
        let needs_statuses = candidates
            .iter()
            .any(|b| !b.rule.required_statuses.is_empty());

        let comments: Fetched<PrComment> = if needs_comments {
            pr.comments().await.map_err(|e| format!("{:#}", e))
        } else {
            Ok(Vec::new())
        };
        let statuses: Fetched<CheckStatus> = if needs_statuses {
            pr.checks().await.map_err(|e| format!("{:#}", e))
        } else {
            Ok(Vec::new())
        };

        let global = Check::Comments {
            comments: &comments,
            rules: &include.comments,
        };
        if global.validate(None, &mut outcome) && self.fail_fast {
            return outcome.finalize();
        }

        let mut rejected = Vec::new();
        for branch in &candidates {
            let mut branch_outcome = ValidationOutcome::new(kind, self.fail_fast);
            let checks = [
                Check::Comments {
                    comments: &comments,
                    rules: &branch.rule.comments,
                },
                Check::RequiredStatuses {
                    statuses: &statuses,
                    required: &branch.rule.required_statuses,
                },
            ];
            run_branch_checks(&checks, branch, &mut branch_outcome);

            if !branch_outcome.has_failures() {
                return outcome.finalize();
            }
            rejected.push(branch_outcome);
        }

        for branch_outcome in rejected {
            outcome.append(branch_outcome);
        }
        outcome.finalize()
    }

    pub fn evaluate_approve_conditions(
        &self,
        pr: &dyn PullRequestFacts,
        policy: &PolicyConfig,
    ) -> ValidationOutcome {
        match policy.approve_include() {
            Some(include) => self.evaluate_conditions(Some(pr), include, PolicyKind::Approve),
            None => ValidationOutcome::new(PolicyKind::Approve, self.fail_fast),
        }
    }

    pub async fn evaluate_approve_comments_and_checks(
        &self,
        pr: &dyn PullRequestFacts,
        policy: &PolicyConfig,
    ) -> ValidationOutcome {
        match policy.approve_include() {
            Some(include) => {
                self.evaluate_comments_and_checks(Some(pr), include, PolicyKind::Approve)
                    .await
            }
            None => ValidationOutcome::new(PolicyKind::Approve, self.fail_fast),
        }
    }

    pub fn evaluate_merge_conditions(
        &self,
        pr: &dyn PullRequestFacts,
        policy: &PolicyConfig,
    ) -> ValidationOutcome {
        match policy.merge_include() {
            Some(include) => self.evaluate_conditions(Some(pr), include, PolicyKind::Merge),
            None => ValidationOutcome::new(PolicyKind::Merge, self.fail_fast),
        }
    }

    pub async fn evaluate_merge_comments_and_checks(
        &self,
        pr: &dyn PullRequestFacts,
        policy: &PolicyConfig,
    ) -> ValidationOutcome {
        match policy.merge_include() {
            Some(include) => {
                self.evaluate_comments_and_checks(Some(pr), include, PolicyKind::Merge)
                    .await
            }
            None => ValidationOutcome::new(PolicyKind::Merge, self.fail_fast),
        }
    }
}

/// Run one candidate's checks, stopping at the first failure under fail-fast.
fn run_branch_checks(
    checks: &[Check<'_>],
    branch: &MatchedBranch<'_>,
    outcome: &mut ValidationOutcome,
) {
    for check in checks {
        if check.validate(Some(branch), outcome) && outcome.fail_fast {
            return;
        }
    }
}
