//! Repository policy schema.
//!
//! A policy file describes when a pull request may be approved and when it
//! may be merged. Both sections share the same `include` block shape: global
//! author/label/comment requirements plus a map of branch rules keyed by an
//! arbitrary name. Branch rules are kept in a `BTreeMap` so that evaluation
//! always walks them in ascending key order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::duration::PolicyDuration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub approve: Option<ApprovePolicy>,
    #[serde(default)]
    pub merge: Option<MergePolicy>,
    #[serde(default)]
    pub error: Option<ErrorPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovePolicy {
    /// Login the approval review is expected to come from.
    #[serde(default)]
    pub approver: String,
    #[serde(default)]
    pub include: Option<Include>,
    /// Parsed for compatibility with existing policy files; never evaluated.
    #[serde(default)]
    pub exclude: Option<Include>,
    #[serde(default)]
    pub required_statuses: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergePolicy {
    #[serde(default)]
    pub method: MergeMethod,
    #[serde(default)]
    pub include: Option<Include>,
    /// Parsed for compatibility with existing policy files; never evaluated.
    #[serde(default)]
    pub exclude: Option<Include>,
    #[serde(default)]
    pub required_statuses: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPolicy {
    #[serde(default)]
    pub level: ErrorCommentLevel,
}

/// Whether infrastructure failures are reported on the pull request.
///
/// Policy rejections are always reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCommentLevel {
    #[serde(alias = "off")]
    None,
    /// Any other level reports everything.
    #[default]
    #[serde(other)]
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Include {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub comments: Vec<CommentRule>,
    #[serde(default)]
    pub branches: BTreeMap<String, BranchRule>,
}

/// Per-branch requirements, selected by head-branch prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchRule {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub required_statuses: Vec<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub age: Option<PolicyDuration>,
    #[serde(default)]
    pub comments: Vec<CommentRule>,
    /// A matching strict rule excludes every other rule except a longer
    /// matching strict rule.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRule {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

impl CommentRule {
    /// A comment satisfies the rule when it starts with the title and
    /// contains the body text anywhere.
    pub fn matches(&self, comment_body: &str) -> bool {
        comment_body.starts_with(&self.title) && comment_body.contains(&self.body)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    #[default]
    Merge,
    Squash,
    Rebase,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMethod::Merge => "merge",
            MergeMethod::Squash => "squash",
            MergeMethod::Rebase => "rebase",
        }
    }
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merge methods a repository permits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCapabilities {
    #[serde(default)]
    pub allow_merge_commit: bool,
    #[serde(default)]
    pub allow_rebase_merge: bool,
    #[serde(default)]
    pub allow_squash_merge: bool,
}

impl MergeCapabilities {
    pub fn allows(&self, method: MergeMethod) -> bool {
        match method {
            MergeMethod::Merge => self.allow_merge_commit,
            MergeMethod::Squash => self.allow_squash_merge,
            MergeMethod::Rebase => self.allow_rebase_merge,
        }
    }
}

/// Pick the desired method if the repository allows it, otherwise the first
/// allowed of merge, rebase and squash.
pub fn resolve_merge_method(
    desired: MergeMethod,
    capabilities: &MergeCapabilities,
) -> Option<MergeMethod> {
    if capabilities.allows(desired) {
        return Some(desired);
    }
    [MergeMethod::Merge, MergeMethod::Rebase, MergeMethod::Squash]
        .into_iter()
        .find(|method| capabilities.allows(*method))
}

impl PolicyConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse policy YAML")
    }

    /// The approve `include` block, or `None` when approval is not configured.
    pub fn approve_include(&self) -> Option<&Include> {
        self.approve.as_ref().and_then(|a| a.include.as_ref())
    }

    /// The merge `include` block, or `None` when merging is not configured.
    pub fn merge_include(&self) -> Option<&Include> {
        self.merge.as_ref().and_then(|m| m.include.as_ref())
    }

    pub fn no_approve(&self) -> bool {
        self.approve_include().is_none()
    }

    pub fn no_merge(&self) -> bool {
        self.merge_include().is_none()
    }

    pub fn merge_method(&self) -> MergeMethod {
        self.merge.as_ref().map(|m| m.method).unwrap_or_default()
    }

    pub fn error_comments_enabled(&self) -> bool {
        self.error
            .as_ref()
            .map(|e| e.level != ErrorCommentLevel::None)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const POLICY: &str = r#"
version: "1.0.0"
approve:
  approver: gatekeeper-approver
  include:
    authors: ["dependabot[bot]"]
    labels: ["automerge"]
    branches:
      dependabot:
        prefix: dependabot/
        strict: true
        age: 2 hours 30 minutes
        required_statuses: ["build"]
      renovate:
        prefix: renovate/
        comments:
          - title: "/approve"
            body: "lgtm"
merge:
  method: squash
  include:
    branches:
      any:
        prefix: ""
error:
  level: none
"#;

    #[test]
    fn test_parse_full_policy() {
        let policy = PolicyConfig::from_yaml(POLICY).unwrap();
        assert_eq!(policy.version, "1.0.0");

        let approve = policy.approve.as_ref().unwrap();
        assert_eq!(approve.approver, "gatekeeper-approver");

        let include = policy.approve_include().unwrap();
        assert_eq!(include.authors, vec!["dependabot[bot]"]);
        assert_eq!(include.labels, vec!["automerge"]);

        let keys: Vec<&String> = include.branches.keys().collect();
        assert_eq!(keys, vec!["dependabot", "renovate"]);

        let dependabot = &include.branches["dependabot"];
        assert!(dependabot.strict);
        assert_eq!(
            dependabot.age.unwrap().as_duration(),
            Duration::from_secs(2 * 3600 + 30 * 60)
        );
        assert_eq!(dependabot.required_statuses, vec!["build"]);

        let renovate = &include.branches["renovate"];
        assert!(!renovate.strict);
        assert_eq!(renovate.comments[0].title, "/approve");

        assert_eq!(policy.merge_method(), MergeMethod::Squash);
        assert!(!policy.error_comments_enabled());
    }

    #[test]
    fn test_missing_sections_disable_policy() {
        let policy = PolicyConfig::from_yaml("version: \"1\"\napprove:\n  approver: x\n").unwrap();
        assert!(policy.no_approve());
        assert!(policy.no_merge());
        assert_eq!(policy.merge_method(), MergeMethod::Merge);
        assert!(policy.error_comments_enabled());
    }

    #[test]
    fn test_error_levels() {
        let level = |yaml: &str| PolicyConfig::from_yaml(yaml).unwrap().error.unwrap().level;
        assert_eq!(level("error:\n  level: none\n"), ErrorCommentLevel::None);
        assert_eq!(level("error:\n  level: off\n"), ErrorCommentLevel::None);
        assert_eq!(level("error:\n  level: all\n"), ErrorCommentLevel::All);
        assert_eq!(level("error: {}\n"), ErrorCommentLevel::All);
    }

    #[test]
    fn test_unknown_error_level_falls_back_to_all() {
        let policy = PolicyConfig::from_yaml("error:\n  level: verbose\n").unwrap();
        assert!(policy.error_comments_enabled());
    }

    #[test]
    fn test_invalid_age_is_rejected() {
        let yaml = "approve:\n  include:\n    branches:\n      a:\n        prefix: a\n        age: later\n";
        let err = PolicyConfig::from_yaml(yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse policy YAML"));
    }

    #[test]
    fn test_comment_rule_matches() {
        let rule = CommentRule {
            title: "/approve".to_string(),
            body: "lgtm".to_string(),
        };
        assert!(rule.matches("/approve\nlooks lgtm to me"));
        assert!(!rule.matches("please /approve lgtm"));
        assert!(!rule.matches("/approve"));

        let title_only = CommentRule {
            title: "/merge".to_string(),
            body: String::new(),
        };
        assert!(title_only.matches("/merge now"));
    }

    #[test]
    fn test_resolve_merge_method_prefers_desired() {
        let caps = MergeCapabilities {
            allow_merge_commit: true,
            allow_rebase_merge: true,
            allow_squash_merge: true,
        };
        assert_eq!(
            resolve_merge_method(MergeMethod::Squash, &caps),
            Some(MergeMethod::Squash)
        );
    }

    #[test]
    fn test_resolve_merge_method_falls_back_in_order() {
        let rebase_and_squash = MergeCapabilities {
            allow_merge_commit: false,
            allow_rebase_merge: true,
            allow_squash_merge: true,
        };
        assert_eq!(
            resolve_merge_method(MergeMethod::Merge, &rebase_and_squash),
            Some(MergeMethod::Rebase)
        );

        let squash_only = MergeCapabilities {
            allow_squash_merge: true,
            ..Default::default()
        };
        assert_eq!(
            resolve_merge_method(MergeMethod::Rebase, &squash_only),
            Some(MergeMethod::Squash)
        );

        assert_eq!(
            resolve_merge_method(MergeMethod::Merge, &MergeCapabilities::default()),
            None
        );
    }
}
