//! The primitive checks a policy is built from.
//!
//! Each check is enabled only when its configured input is non-empty. A
//! disabled check never records anything. `validate` records failures into
//! the outcome and returns `true` when it recorded at least one.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::duration::{format_hms, round_to_minute};
use crate::facts::{CheckStatus, PrComment};
use crate::policy::CommentRule;
use crate::validation::{Reason, ValidationOutcome};
use crate::validator::MatchedBranch;

/// Result of fetching live data, with the error already rendered.
pub type Fetched<T> = std::result::Result<Vec<T>, String>;

#[derive(Debug)]
pub enum Check<'a> {
    Author {
        author: &'a str,
        allowed: &'a [String],
    },
    Labels {
        present: &'a [String],
        required: &'a [String],
    },
    Age {
        minimum: Option<Duration>,
        created_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    },
    Comments {
        comments: &'a Fetched<PrComment>,
        rules: &'a [CommentRule],
    },
    RequiredStatuses {
        statuses: &'a Fetched<CheckStatus>,
        required: &'a [String],
    },
}

impl Check<'_> {
    pub fn is_enabled(&self) -> bool {
        match self {
            Check::Author { allowed, .. } => !allowed.is_empty(),
            Check::Labels { required, .. } => !required.is_empty(),
            Check::Age { minimum, .. } => minimum.is_some_and(|m| !m.is_zero()),
            Check::Comments { rules, .. } => !rules.is_empty(),
            Check::RequiredStatuses { required, .. } => !required.is_empty(),
        }
    }

    pub fn validate(
        &self,
        scope: Option<&MatchedBranch<'_>>,
        outcome: &mut ValidationOutcome,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let kind = outcome.kind;
        match self {
            Check::Author { author, allowed } => {
                if allowed.iter().any(|a| a == author) {
                    return false;
                }
                outcome.record(
                    scope,
                    Reason::Author,
                    format!("Author is not in the list of approved authors for {}", kind),
                );
                true
            }

            Check::Labels { present, required } => {
                if required.iter().all(|r| present.contains(r)) {
                    return false;
                }
                outcome.record(
                    scope,
                    Reason::Labels,
                    format!("Labels do not match for {}", kind),
                );
                true
            }

            Check::Age {
                minimum,
                created_at,
                now,
            } => {
                let Some(minimum) = minimum else {
                    return false;
                };
                let Some(created_at) = created_at else {
                    outcome.record(
                        scope,
                        Reason::Age,
                        format!("Error getting pull request age for {}", kind),
                    );
                    return true;
                };

                let threshold = chrono::Duration::from_std(*minimum)
                    .ok()
                    .and_then(|min| now.checked_sub_signed(min));
                if let Some(threshold) = threshold {
                    if threshold >= *created_at {
                        return false;
                    }
                }

                let remaining = threshold
                    .and_then(|t| (*created_at - t).to_std().ok())
                    .unwrap_or(*minimum);
                outcome.record(
                    scope,
                    Reason::Age,
                    format!(
                        "Pull request age is less than required ({}) for {}",
                        format_hms(round_to_minute(remaining)),
                        kind
                    ),
                );
                true
            }

            Check::Comments { comments, rules } => {
                let mut failed = false;
                let fetched: &[PrComment] = match comments {
                    Ok(list) => list,
                    Err(e) => {
                        outcome.record(
                            scope,
                            Reason::Comments,
                            format!("Error getting comments {}", e),
                        );
                        if outcome.fail_fast {
                            return true;
                        }
                        failed = true;
                        &[]
                    }
                };

                for rule in rules.iter() {
                    if fetched.iter().any(|c| rule.matches(&c.body)) {
                        continue;
                    }
                    outcome.record(
                        scope,
                        Reason::Comments,
                        format!("{} comments do not match", kind),
                    );
                    if outcome.fail_fast {
                        return true;
                    }
                    failed = true;
                }
                failed
            }

            Check::RequiredStatuses { statuses, required } => {
                let mut failed = false;
                let fetched: &[CheckStatus] = match statuses {
                    Ok(list) => list,
                    Err(e) => {
                        outcome.record(
                            scope,
                            Reason::Statuses,
                            format!("Error getting success statuses {}", e),
                        );
                        if outcome.fail_fast {
                            return true;
                        }
                        failed = true;
                        &[]
                    }
                };

                let passed: BTreeSet<&str> = fetched
                    .iter()
                    .filter(|s| s.state.is_terminal_pass())
                    .map(|s| s.name.as_str())
                    .collect();
                let missing: BTreeSet<&str> = required
                    .iter()
                    .map(String::as_str)
                    .filter(|name| !passed.contains(name))
                    .collect();

                if !missing.is_empty() {
                    outcome.record(
                        scope,
                        Reason::Statuses,
                        format!(
                            "Required statuses not found: {}",
                            missing.into_iter().collect::<Vec<_>>().join(", ")
                        ),
                    );
                    failed = true;
                }
                failed
            }
        }
    }
}
