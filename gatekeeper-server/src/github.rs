use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use gatekeeper_core::{CheckState, CheckStatus, MergeMethod, PrComment};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, Method, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::operations::{
    ApiError, Comparison, EventMeta, GitHubConnector, GitHubOperations, PullRequest, RepoRef,
    Repository, User,
};
use crate::recording::{RecordingLogger, RecordingMiddleware};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

#[derive(Clone)]
enum Credentials {
    App {
        app_id: u64,
        private_key: String,
        token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
    },
    Token(String),
}

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    api_url: String,
    credentials: Credentials,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct CommentResponse {
    #[serde(default)]
    user: User,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct CombinedStatusResponse {
    #[serde(default)]
    statuses: Vec<StatusResponse>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    context: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    #[serde(default)]
    check_runs: Vec<CheckRunResponse>,
}

#[derive(Debug, Deserialize)]
struct CheckRunResponse {
    name: String,
    status: String,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileContentsResponse {
    content: String,
}

#[derive(Debug, Serialize)]
struct DispatchRequest<'a> {
    event_type: &'a str,
    client_payload: &'a Value,
}

/// Map a status or check-run state string onto the shared vocabulary.
pub fn parse_check_state(state: &str) -> CheckState {
    serde_json::from_value(Value::String(state.to_ascii_lowercase())).unwrap_or(CheckState::Unknown)
}

fn check_run_state(run: &CheckRunResponse) -> CheckState {
    if run.status != "completed" {
        return parse_check_state(&run.status);
    }
    match &run.conclusion {
        Some(conclusion) => parse_check_state(conclusion),
        None => CheckState::Completed,
    }
}

impl GitHubClient {
    /// Client authenticating as a GitHub App installation.
    pub fn new_app(
        app_id: u64,
        private_key: String,
        api_url: &str,
        recording_logger: Option<RecordingLogger>,
    ) -> Self {
        Self {
            client: create_github_client(recording_logger),
            api_url: api_url.trim_end_matches('/').to_string(),
            credentials: Credentials::App {
                app_id,
                private_key,
                token_cache: Arc::new(RwLock::new(HashMap::new())),
            },
        }
    }

    /// Client authenticating with a fixed personal or installation token.
    pub fn with_token(token: String, api_url: &str) -> Self {
        Self {
            client: create_github_client(None),
            api_url: api_url.trim_end_matches('/').to_string(),
            credentials: Credentials::Token(token),
        }
    }

    fn generate_jwt(app_id: u64, private_key: &str) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: app_id,
            iat: now - 60,  // Issued 60 seconds ago to account for clock skew
            exp: now + 600, // Expires in 10 minutes
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }

    async fn get_installation_token(
        &self,
        app_id: u64,
        private_key: &str,
        token_cache: &RwLock<HashMap<u64, (String, SystemTime)>>,
        installation_id: u64,
    ) -> Result<String> {
        // Reuse cached token while it has more than 5 minutes left
        {
            let cache = token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                if expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs()
                    > 300
                {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = Self::generate_jwt(app_id, private_key)?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, installation_id
        );

        info!("Requesting new installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .context("Failed to send installation token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!(
                "GitHub App token request failed: {} - {}",
                status, error_text
            );
            return Err(anyhow!(
                "GitHub App token request failed: {} - {}",
                status,
                error_text
            ));
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);
        let expires_at_system =
            UNIX_EPOCH + std::time::Duration::from_secs(expires_at.timestamp().max(0) as u64);

        token_cache.write().await.insert(
            installation_id,
            (token_response.token.clone(), expires_at_system),
        );

        info!("Successfully obtained installation access token");
        Ok(token_response.token)
    }

    /// Token for API calls on behalf of `installation_id`.
    pub async fn token(&self, installation_id: Option<u64>) -> Result<String> {
        match &self.credentials {
            Credentials::Token(token) => Ok(token.clone()),
            Credentials::App {
                app_id,
                private_key,
                token_cache,
            } => {
                let installation_id = installation_id
                    .context("GitHub App requests need an installation id")?;
                self.get_installation_token(*app_id, private_key, token_cache, installation_id)
                    .await
            }
        }
    }

    /// Send a request and fail with [`ApiError`] on a non-success status.
    async fn send(
        &self,
        method: Method,
        path: &str,
        token: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.api_url, path);
        debug!("{} {}", method, url);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json");
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(serde_json::to_string(body)?);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send {} {}", method, path))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!("GitHub API error: {} - {}", status, error_text);
            return Err(ApiError {
                status: status.as_u16(),
                body: error_text,
            }
            .into());
        }

        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T> {
        self.send(Method::GET, path, token, None)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", path))
    }

    pub async fn get_pull_request(
        &self,
        token: &str,
        repo: &RepoRef,
        number: u64,
    ) -> Result<PullRequest> {
        self.get_json(&format!("/repos/{}/pulls/{}", repo, number), token)
            .await
    }

    pub async fn get_repository(&self, token: &str, repo: &RepoRef) -> Result<Repository> {
        self.get_json(&format!("/repos/{}", repo), token).await
    }

    pub async fn list_statuses(
        &self,
        token: &str,
        repo: &RepoRef,
        git_ref: &str,
    ) -> Result<Vec<CheckStatus>> {
        let combined: CombinedStatusResponse = self
            .get_json(&format!("/repos/{}/commits/{}/status", repo, git_ref), token)
            .await?;
        let runs: CheckRunsResponse = self
            .get_json(
                &format!(
                    "/repos/{}/commits/{}/check-runs?filter=latest&per_page=100",
                    repo, git_ref
                ),
                token,
            )
            .await?;

        let mut statuses: Vec<CheckStatus> = combined
            .statuses
            .iter()
            .map(|s| CheckStatus::new(&s.context, parse_check_state(&s.state)))
            .collect();
        statuses.extend(
            runs.check_runs
                .iter()
                .map(|run| CheckStatus::new(&run.name, check_run_state(run))),
        );
        Ok(statuses)
    }

    pub async fn list_comments(
        &self,
        token: &str,
        repo: &RepoRef,
        number: u64,
    ) -> Result<Vec<PrComment>> {
        let comments: Vec<CommentResponse> = self
            .get_json(
                &format!("/repos/{}/issues/{}/comments?per_page=100", repo, number),
                token,
            )
            .await?;
        Ok(comments
            .into_iter()
            .map(|c| PrComment {
                author: c.user.login,
                body: c.body,
            })
            .collect())
    }

    pub async fn post_comment(
        &self,
        token: &str,
        repo: &RepoRef,
        number: u64,
        body: &str,
    ) -> Result<()> {
        info!("Posting comment to PR #{} in {}", number, repo);
        self.send(
            Method::POST,
            &format!("/repos/{}/issues/{}/comments", repo, number),
            token,
            Some(&json!({ "body": body })),
        )
        .await?;
        Ok(())
    }

    pub async fn compare(
        &self,
        token: &str,
        repo: &RepoRef,
        base: &str,
        head: &str,
    ) -> Result<Comparison> {
        self.get_json(&format!("/repos/{}/compare/{}...{}", repo, base, head), token)
            .await
    }

    pub async fn update_branch(
        &self,
        token: &str,
        repo: &RepoRef,
        number: u64,
        expected_head_sha: &str,
    ) -> Result<()> {
        info!("Requesting branch update for PR #{} in {}", number, repo);
        self.send(
            Method::PUT,
            &format!("/repos/{}/pulls/{}/update-branch", repo, number),
            token,
            Some(&json!({ "expected_head_sha": expected_head_sha })),
        )
        .await?;
        Ok(())
    }

    pub async fn submit_approval(&self, token: &str, repo: &RepoRef, number: u64) -> Result<()> {
        info!("Approving PR #{} in {}", number, repo);
        self.send(
            Method::POST,
            &format!("/repos/{}/pulls/{}/reviews", repo, number),
            token,
            Some(&json!({ "event": "APPROVE" })),
        )
        .await?;
        Ok(())
    }

    pub async fn merge_pull_request(
        &self,
        token: &str,
        repo: &RepoRef,
        number: u64,
        method: Option<MergeMethod>,
    ) -> Result<()> {
        info!(
            "Merging PR #{} in {} using {}",
            number,
            repo,
            method.map(|m| m.as_str()).unwrap_or("repository default")
        );
        let body = match method {
            Some(m) => json!({ "merge_method": m.as_str() }),
            None => json!({}),
        };
        self.send(
            Method::PUT,
            &format!("/repos/{}/pulls/{}/merge", repo, number),
            token,
            Some(&body),
        )
        .await?;
        Ok(())
    }

    pub async fn list_open_pull_requests(
        &self,
        token: &str,
        repo: &RepoRef,
        page: u32,
    ) -> Result<Vec<PullRequest>> {
        self.get_json(
            &format!("/repos/{}/pulls?state=open&per_page=50&page={}", repo, page),
            token,
        )
        .await
    }

    pub async fn list_org_repositories(
        &self,
        token: &str,
        org: &str,
        page: u32,
    ) -> Result<Vec<Repository>> {
        self.get_json(
            &format!("/orgs/{}/repos?per_page=100&page={}", org, page),
            token,
        )
        .await
    }

    pub async fn create_dispatch(
        &self,
        token: &str,
        repo: &RepoRef,
        event_type: &str,
        payload: &Value,
    ) -> Result<()> {
        let request = DispatchRequest {
            event_type,
            client_payload: payload,
        };
        self.send(
            Method::POST,
            &format!("/repos/{}/dispatches", repo),
            token,
            Some(&serde_json::to_value(&request)?),
        )
        .await?;
        Ok(())
    }

    /// Contents of a file on `git_ref`, or `None` if it does not exist.
    pub async fn get_file_contents(
        &self,
        token: &str,
        repo: &RepoRef,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<String>> {
        let result = self
            .get_json::<FileContentsResponse>(
                &format!("/repos/{}/contents/{}?ref={}", repo, path, git_ref),
                token,
            )
            .await;

        let file = match result {
            Ok(file) => file,
            Err(e) => {
                if let Some(api) = e.downcast_ref::<ApiError>() {
                    if api.status == StatusCode::NOT_FOUND.as_u16() {
                        return Ok(None);
                    }
                }
                return Err(e);
            }
        };

        // GitHub wraps base64 content at 60 characters
        let cleaned: String = file.content.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = general_purpose::STANDARD
            .decode(cleaned)
            .with_context(|| format!("Failed to decode {} from {}", path, repo))?;
        String::from_utf8(bytes)
            .map(Some)
            .with_context(|| format!("{} in {} is not valid UTF-8", path, repo))
    }

    pub fn installation(
        self: &Arc<Self>,
        installation_id: Option<u64>,
        approver_token: Option<String>,
    ) -> InstallationClient {
        InstallationClient {
            github: Arc::clone(self),
            installation_id,
            approver_token,
        }
    }
}

/// `GitHubOperations` for a single installation.
#[derive(Clone)]
pub struct InstallationClient {
    github: Arc<GitHubClient>,
    installation_id: Option<u64>,
    approver_token: Option<String>,
}

impl InstallationClient {
    async fn token(&self) -> Result<String> {
        self.github.token(self.installation_id).await
    }
}

#[async_trait]
impl GitHubOperations for InstallationClient {
    async fn get_pull_request(&self, repo: &RepoRef, number: u64) -> Result<PullRequest> {
        let token = self.token().await?;
        self.github.get_pull_request(&token, repo, number).await
    }

    async fn get_repository(&self, repo: &RepoRef) -> Result<Repository> {
        let token = self.token().await?;
        self.github.get_repository(&token, repo).await
    }

    async fn list_statuses(&self, repo: &RepoRef, git_ref: &str) -> Result<Vec<CheckStatus>> {
        let token = self.token().await?;
        self.github.list_statuses(&token, repo, git_ref).await
    }

    async fn list_comments(&self, repo: &RepoRef, number: u64) -> Result<Vec<PrComment>> {
        let token = self.token().await?;
        self.github.list_comments(&token, repo, number).await
    }

    async fn add_comment(&self, repo: &RepoRef, number: u64, body: &str) -> Result<()> {
        let token = self.token().await?;
        self.github.post_comment(&token, repo, number, body).await
    }

    async fn compare(&self, repo: &RepoRef, base: &str, head: &str) -> Result<Comparison> {
        let token = self.token().await?;
        self.github.compare(&token, repo, base, head).await
    }

    async fn request_branch_update(
        &self,
        repo: &RepoRef,
        number: u64,
        expected_head_sha: &str,
    ) -> Result<()> {
        let token = self.token().await?;
        self.github
            .update_branch(&token, repo, number, expected_head_sha)
            .await
    }

    async fn approve(&self, repo: &RepoRef, number: u64) -> Result<()> {
        // The bot cannot approve its own changes, so prefer a separate identity
        let token = match &self.approver_token {
            Some(token) => token.clone(),
            None => {
                warn!("No approver token configured, approving as the app installation");
                self.token().await?
            }
        };
        self.github.submit_approval(&token, repo, number).await
    }

    async fn merge(&self, repo: &RepoRef, number: u64, method: Option<MergeMethod>) -> Result<()> {
        let token = self.token().await?;
        self.github
            .merge_pull_request(&token, repo, number, method)
            .await
    }
}

/// Connects events to installation clients sharing one token cache.
pub struct InstallationConnector {
    github: Arc<GitHubClient>,
    approver_token: Option<String>,
}

impl InstallationConnector {
    pub fn new(github: Arc<GitHubClient>, approver_token: Option<String>) -> Self {
        Self {
            github,
            approver_token,
        }
    }
}

impl GitHubConnector for InstallationConnector {
    fn connect(&self, meta: &EventMeta) -> Arc<dyn GitHubOperations> {
        Arc::new(
            self.github
                .installation(meta.installation_id, self.approver_token.clone()),
        )
    }
}

pub fn create_github_client(recording_logger: Option<RecordingLogger>) -> ClientWithMiddleware {
    use reqwest_middleware::ClientBuilder;

    let client = Client::builder()
        .user_agent(concat!("gatekeeper/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("Failed to create HTTP client");

    let mut builder = ClientBuilder::new(client);

    if let Some(logger) = recording_logger {
        builder = builder.with(RecordingMiddleware::new(logger));
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_check_state() {
        assert_eq!(parse_check_state("success"), CheckState::Success);
        assert_eq!(parse_check_state("SUCCESS"), CheckState::Success);
        assert_eq!(parse_check_state("in_progress"), CheckState::InProgress);
        assert_eq!(parse_check_state("timed_out"), CheckState::TimedOut);
        assert_eq!(parse_check_state("something_new"), CheckState::Unknown);
    }

    #[test]
    fn test_check_run_state_uses_conclusion_once_completed() {
        let run = |status: &str, conclusion: Option<&str>| CheckRunResponse {
            name: "build".to_string(),
            status: status.to_string(),
            conclusion: conclusion.map(str::to_string),
        };

        assert_eq!(check_run_state(&run("queued", None)), CheckState::Queued);
        assert_eq!(
            check_run_state(&run("in_progress", Some("failure"))),
            CheckState::InProgress
        );
        assert_eq!(
            check_run_state(&run("completed", Some("skipped"))),
            CheckState::Skipped
        );
        assert_eq!(
            check_run_state(&run("completed", Some("failure"))),
            CheckState::Failure
        );
        assert_eq!(check_run_state(&run("completed", None)), CheckState::Completed);
    }

    #[tokio::test]
    async fn test_token_credentials_skip_installation_lookup() {
        let client = GitHubClient::with_token("ghp_test".to_string(), DEFAULT_API_URL);
        assert_eq!(client.token(None).await.unwrap(), "ghp_test");
        assert_eq!(client.token(Some(5)).await.unwrap(), "ghp_test");
    }

    #[tokio::test]
    async fn test_app_credentials_require_installation() {
        let client = GitHubClient::new_app(1, "not a key".to_string(), DEFAULT_API_URL, None);
        let err = client.token(None).await.unwrap_err();
        assert!(err.to_string().contains("installation id"));
    }

    #[test]
    fn test_api_url_trailing_slash_is_trimmed() {
        let client = GitHubClient::with_token("t".to_string(), "https://ghe.example.com/api/v3/");
        assert_eq!(client.api_url, "https://ghe.example.com/api/v3");
    }
}
