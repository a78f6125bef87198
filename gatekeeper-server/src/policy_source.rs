//! Where a repository's policy comes from.

use anyhow::{Context, Result};
use async_trait::async_trait;
use gatekeeper_core::PolicyConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::github::GitHubClient;
use crate::operations::{EventMeta, Repository};

pub const LOCAL_POLICY_FILES: [&str; 2] = ["gatekeeper.yml", "gatekeeper-example.yml"];
pub const REPOSITORY_POLICY_FILES: [&str; 2] = [".github/gatekeeper.yml", ".github/gatekeeper.yaml"];

#[async_trait]
pub trait PolicySource: Send + Sync {
    /// `Ok(None)` when the repository has no policy.
    async fn load(&self, repository: &Repository, meta: &EventMeta)
        -> Result<Option<PolicyConfig>>;
}

/// One policy file from a local directory, shared by every repository.
pub struct LocalPolicySource {
    dir: PathBuf,
}

impl LocalPolicySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PolicySource for LocalPolicySource {
    async fn load(
        &self,
        _repository: &Repository,
        _meta: &EventMeta,
    ) -> Result<Option<PolicyConfig>> {
        for name in LOCAL_POLICY_FILES {
            let path = self.dir.join(name);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {}", path.display()))
                }
            };
            debug!("Loaded policy from {}", path.display());
            return PolicyConfig::from_yaml(&content)
                .with_context(|| format!("Invalid policy in {}", path.display()))
                .map(Some);
        }
        Ok(None)
    }
}

/// The policy file committed to the repository's default branch.
pub struct RepositoryPolicySource {
    github: Arc<GitHubClient>,
}

impl RepositoryPolicySource {
    pub fn new(github: Arc<GitHubClient>) -> Self {
        Self { github }
    }
}

#[async_trait]
impl PolicySource for RepositoryPolicySource {
    async fn load(
        &self,
        repository: &Repository,
        meta: &EventMeta,
    ) -> Result<Option<PolicyConfig>> {
        let token = self.github.token(meta.installation_id).await?;
        let repo = repository.repo_ref();

        for path in REPOSITORY_POLICY_FILES {
            let content = self
                .github
                .get_file_contents(&token, &repo, path, &repository.default_branch)
                .await?;
            if let Some(content) = content {
                info!("Loaded policy from {}:{}", repo, path);
                return PolicyConfig::from_yaml(&content)
                    .with_context(|| format!("Invalid policy in {}:{}", repo, path))
                    .map(Some);
            }
        }

        debug!("No policy file in {}", repo);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::repository;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gatekeeper-policy-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_local_source_reads_policy() {
        let dir = temp_dir();
        std::fs::write(
            dir.join("gatekeeper.yml"),
            "approve:\n  include:\n    authors: [\"dependabot[bot]\"]\n",
        )
        .unwrap();

        let policy = LocalPolicySource::new(&dir)
            .load(&repository(), &EventMeta::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            policy.approve_include().unwrap().authors,
            vec!["dependabot[bot]"]
        );

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_local_source_falls_back_to_example_file() {
        let dir = temp_dir();
        std::fs::write(dir.join("gatekeeper-example.yml"), "version: \"2\"\n").unwrap();

        let policy = LocalPolicySource::new(&dir)
            .load(&repository(), &EventMeta::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(policy.version, "2");

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_local_source_without_file() {
        let dir = temp_dir();
        let policy = LocalPolicySource::new(&dir)
            .load(&repository(), &EventMeta::default())
            .await
            .unwrap();
        assert!(policy.is_none());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_local_source_reports_invalid_yaml() {
        let dir = temp_dir();
        std::fs::write(dir.join("gatekeeper.yml"), "approve: [unclosed\n").unwrap();

        let err = LocalPolicySource::new(&dir)
            .load(&repository(), &EventMeta::default())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid policy"));

        std::fs::remove_dir_all(dir).unwrap();
    }
}
