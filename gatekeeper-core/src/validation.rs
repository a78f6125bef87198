//! Outcome of a policy evaluation.

use serde::Serialize;
use std::fmt;

use crate::validator::MatchedBranch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PolicyKind {
    Approve,
    Merge,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Approve => write!(f, "Approve"),
            PolicyKind::Merge => write!(f, "Merge"),
        }
    }
}

/// Why a check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reason {
    Author,
    Labels,
    Age,
    Comments,
    Branch,
    Statuses,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::Author => "author",
            Reason::Labels => "labels",
            Reason::Age => "age",
            Reason::Comments => "comments",
            Reason::Branch => "branch",
            Reason::Statuses => "statuses",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    /// Key of the branch rule that produced this result, if any.
    pub config_key: Option<String>,
    /// Prefix of that branch rule.
    pub branch: Option<String>,
    pub reason: Reason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub success: bool,
    pub kind: PolicyKind,
    pub results: Vec<ValidationResult>,
    pub fail_fast: bool,
}

impl ValidationOutcome {
    /// A fresh outcome starts unsuccessful until finalized.
    pub fn new(kind: PolicyKind, fail_fast: bool) -> Self {
        Self {
            success: false,
            kind,
            results: Vec::new(),
            fail_fast,
        }
    }

    pub fn add_result(&mut self, reason: Reason, message: impl Into<String>) {
        self.results.push(ValidationResult {
            config_key: None,
            branch: None,
            reason,
            message: message.into(),
        });
    }

    pub fn add_branch_result(
        &mut self,
        branch: &MatchedBranch<'_>,
        reason: Reason,
        message: impl Into<String>,
    ) {
        self.results.push(ValidationResult {
            config_key: Some(branch.key.to_string()),
            branch: Some(branch.rule.prefix.clone()),
            reason,
            message: message.into(),
        });
    }

    pub fn record(
        &mut self,
        scope: Option<&MatchedBranch<'_>>,
        reason: Reason,
        message: impl Into<String>,
    ) {
        match scope {
            Some(branch) => self.add_branch_result(branch, reason, message),
            None => self.add_result(reason, message),
        }
    }

    pub fn append(&mut self, other: ValidationOutcome) {
        self.results.extend(other.results);
    }

    pub fn has_failures(&self) -> bool {
        !self.results.is_empty()
    }

    pub fn finalize(mut self) -> Self {
        self.success = self.results.is_empty();
        self
    }

    /// Markdown comment explaining why the pull request was not processed.
    pub fn to_markdown(&self) -> String {
        if self.success {
            return format!("{} conditions are satisfied.", self.kind);
        }

        let mut out = format!(
            "### {} conditions not met\n\nThis pull request does not satisfy the repository {} policy.\n",
            self.kind,
            self.kind.to_string().to_lowercase()
        );

        if self.results.is_empty() {
            out.push_str("\nNo matching policy is configured.\n");
            return out;
        }

        out.push_str("\n| Rule | Branch | Reason | Details |\n|------|--------|--------|---------|\n");
        for result in &self.results {
            out.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                table_cell(result.config_key.as_deref().unwrap_or("global")),
                table_cell(result.branch.as_deref().unwrap_or("")),
                result.reason,
                table_cell(&result.message),
            ));
        }
        out
    }
}

fn table_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::BranchRule;

    #[test]
    fn test_finalize_recomputes_success() {
        let outcome = ValidationOutcome::new(PolicyKind::Approve, false);
        assert!(!outcome.success);
        assert!(outcome.clone().finalize().success);

        let mut failed = outcome;
        failed.add_result(Reason::Labels, "Labels do not match for Approve");
        assert!(!failed.finalize().success);
    }

    #[test]
    fn test_branch_results_carry_key_and_prefix() {
        let rule = BranchRule {
            prefix: "dependabot/".to_string(),
            ..Default::default()
        };
        let branch = MatchedBranch {
            key: "deps",
            rule: &rule,
        };

        let mut outcome = ValidationOutcome::new(PolicyKind::Merge, false);
        outcome.record(Some(&branch), Reason::Age, "too young");
        outcome.record(None, Reason::Author, "nope");

        assert_eq!(outcome.results[0].config_key.as_deref(), Some("deps"));
        assert_eq!(outcome.results[0].branch.as_deref(), Some("dependabot/"));
        assert_eq!(outcome.results[1].config_key, None);
    }

    #[test]
    fn test_markdown_lists_every_result() {
        let mut outcome = ValidationOutcome::new(PolicyKind::Merge, false);
        outcome.add_result(Reason::Statuses, "Required statuses not found: a | b");
        outcome.add_result(Reason::Branch, "Branch not found");
        let outcome = outcome.finalize();

        let markdown = outcome.to_markdown();
        assert!(markdown.starts_with("### Merge conditions not met"));
        assert!(markdown.contains("| global |  | statuses | Required statuses not found: a \\| b |"));
        assert!(markdown.contains("| branch | Branch not found |"));
    }

    #[test]
    fn test_markdown_for_unconfigured_policy() {
        let outcome = ValidationOutcome::new(PolicyKind::Approve, false);
        assert!(outcome.to_markdown().contains("No matching policy is configured."));
    }
}
