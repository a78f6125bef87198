use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use tracing::Level;

use crate::dispatch::ReviewerMode;

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    pub github_webhook_secret: String,
    /// Token for a separate account that submits approval reviews.
    pub github_approver_token: Option<String>,
    pub github_api_url: String,
    pub port: u16,
    pub reviewer_type: ReviewerMode,
    /// Directory holding a shared policy file. When unset, each repository's
    /// own `.github/gatekeeper.yml` is used.
    pub local_config_path: Option<PathBuf>,
    pub log_search_url: Option<String>,
    pub log_level: Level,
    pub recording_enabled: bool,
    pub recording_log_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_app_id = env::var("GITHUB_APP_ID")
            .context("GITHUB_APP_ID environment variable is required")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        let github_private_key = env::var("GITHUB_PRIVATE_KEY")
            .context("GITHUB_PRIVATE_KEY environment variable is required")?
            .replace("\\n", "\n");

        let github_webhook_secret = env::var("GITHUB_WEBHOOK_SECRET")
            .context("GITHUB_WEBHOOK_SECRET environment variable is required")?;

        let github_approver_token = parse_optional(env::var("GITHUB_APPROVER_TOKEN").ok());

        let github_api_url = env::var("GITHUB_API_URL")
            .unwrap_or_else(|_| crate::github::DEFAULT_API_URL.to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let reviewer_type = parse_optional(env::var("REVIEWER_TYPE").ok())
            .map(|s| s.parse::<ReviewerMode>())
            .transpose()
            .context("REVIEWER_TYPE must be either queue or direct")?
            .unwrap_or_default();

        let local_config_path =
            parse_optional(env::var("LOCAL_CONFIG_PATH").ok()).map(PathBuf::from);

        let log_search_url = parse_optional(env::var("LOG_SEARCH_URL").ok());

        let log_level = parse_log_level(env::var("LOG_LEVEL").ok())?;

        let recording_enabled = env::var("RECORDING_ENABLED")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let recording_log_path =
            env::var("RECORDING_LOG_PATH").unwrap_or_else(|_| "recordings.jsonl".to_string());

        Ok(Config {
            github_app_id,
            github_private_key,
            github_webhook_secret,
            github_approver_token,
            github_api_url,
            port,
            reviewer_type,
            local_config_path,
            log_search_url,
            log_level,
            recording_enabled,
            recording_log_path,
        })
    }
}

/// Treat missing, empty and whitespace-only values as unset.
pub fn parse_optional(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// `LOG_LEVEL`, defaulting to `info`.
pub fn parse_log_level(value: Option<String>) -> Result<Level> {
    match parse_optional(value) {
        Some(level) => level
            .trim()
            .parse::<Level>()
            .with_context(|| format!("LOG_LEVEL must be a tracing level, got {}", level)),
        None => Ok(Level::INFO),
    }
}
