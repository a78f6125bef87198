use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use gatekeeper_core::{
    DispatchBackoff, FixturePullRequest, PolicyConfig, PolicyKind, PolicyValidator,
    ValidationOutcome,
};
use gatekeeper_server::github::DEFAULT_API_URL;
use gatekeeper_server::{DispatchPayload, GitHubClient, PullRequest, RepoRef};
use std::fs;
use std::path::PathBuf;
use tracing::{info, Level};

/// Gatekeeper: policy-driven pull request approval and merging
#[derive(Parser, Debug)]
#[command(name = "gatekeeper")]
#[command(about = "Policy-driven pull request approval and merging", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate a policy against a pull request fixture
    Check(CheckArgs),
    /// Send repository_dispatch events for open pull requests
    Dispatch(DispatchArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Approve,
    Merge,
}

impl From<Kind> for PolicyKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Approve => PolicyKind::Approve,
            Kind::Merge => PolicyKind::Merge,
        }
    }
}

#[derive(Parser, Debug)]
struct CheckArgs {
    /// Policy file (YAML)
    #[arg(long)]
    policy: PathBuf,

    /// Pull request fixture (JSON)
    #[arg(long)]
    pull_request: PathBuf,

    /// Which policy section to evaluate
    #[arg(long, value_enum, default_value = "approve")]
    kind: Kind,

    /// Stop at the first failing check
    #[arg(long)]
    fail_fast: bool,

    /// Also evaluate comment and status requirements from the fixture
    #[arg(long)]
    live: bool,

    /// Evaluate ages as of this RFC 3339 instant instead of now
    #[arg(long)]
    now: Option<DateTime<Utc>>,

    /// Print the outcome as JSON instead of Markdown
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct DispatchArgs {
    /// Repository to replay, as owner/name (repeatable)
    #[arg(long = "repo")]
    repos: Vec<String>,

    /// Replay every non-archived repository of this organization
    #[arg(long)]
    org: Option<String>,

    /// GitHub token with permission to create dispatch events
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    token: String,

    /// GitHub API base URL
    #[arg(long, env = "GITHUB_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// If set, list what would be dispatched without sending anything
    #[arg(long)]
    dry_run: bool,
}

async fn evaluate(
    policy: &PolicyConfig,
    fixture: &FixturePullRequest,
    kind: PolicyKind,
    validator: PolicyValidator,
    live: bool,
) -> ValidationOutcome {
    let conditions = match kind {
        PolicyKind::Approve => validator.evaluate_approve_conditions(fixture, policy),
        PolicyKind::Merge => validator.evaluate_merge_conditions(fixture, policy),
    };
    if !live || !conditions.success {
        return conditions;
    }
    match kind {
        PolicyKind::Approve => {
            validator
                .evaluate_approve_comments_and_checks(fixture, policy)
                .await
        }
        PolicyKind::Merge => {
            validator
                .evaluate_merge_comments_and_checks(fixture, policy)
                .await
        }
    }
}

async fn run_check(args: CheckArgs) -> Result<()> {
    let policy_yaml = fs::read_to_string(&args.policy)
        .with_context(|| format!("Failed to read {}", args.policy.display()))?;
    let policy = PolicyConfig::from_yaml(&policy_yaml)?;

    let fixture_json = fs::read_to_string(&args.pull_request)
        .with_context(|| format!("Failed to read {}", args.pull_request.display()))?;
    let fixture = FixturePullRequest::from_json(&fixture_json)?;

    let mut validator = PolicyValidator::new(args.fail_fast);
    if let Some(now) = args.now {
        validator = validator.at(now);
    }

    let kind = PolicyKind::from(args.kind);
    let outcome = evaluate(&policy, &fixture, kind, validator, args.live).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.to_markdown());
    }

    if !outcome.success {
        bail!("{} conditions not met", kind);
    }
    Ok(())
}

/// Just enough of a pull request for the server to pick it up again.
fn minimal_pull_request(pr: &PullRequest) -> PullRequest {
    PullRequest {
        number: pr.number,
        state: "open".to_string(),
        user: pr.user.clone(),
        head: pr.head.clone(),
        base: pr.base.clone(),
        ..Default::default()
    }
}

fn parse_repos(repos: &[String]) -> Result<Vec<RepoRef>> {
    repos
        .iter()
        .map(|r| RepoRef::parse(r).ok_or_else(|| anyhow!("Expected owner/name, got {}", r)))
        .collect()
}

async fn list_org_repos(github: &GitHubClient, token: &str, org: &str) -> Result<Vec<RepoRef>> {
    let mut repos = Vec::new();
    for page in 1.. {
        let batch = github.list_org_repositories(token, org, page).await?;
        if batch.is_empty() {
            break;
        }
        repos.extend(batch.iter().filter(|r| !r.archived).map(|r| r.repo_ref()));
    }
    Ok(repos)
}

async fn run_dispatch(args: DispatchArgs) -> Result<()> {
    let github = GitHubClient::with_token(args.token.clone(), &args.api_url);
    let token = args.token.as_str();

    let mut repos = parse_repos(&args.repos)?;
    if let Some(org) = &args.org {
        repos.extend(list_org_repos(&github, token, org).await?);
    }
    if repos.is_empty() {
        bail!("Nothing to dispatch: pass --repo or --org");
    }

    let backoff = DispatchBackoff::default();
    let mut sent: u64 = 0;

    for repo in &repos {
        for page in 1.. {
            let prs = github.list_open_pull_requests(token, repo, page).await?;
            if prs.is_empty() {
                break;
            }
            for pr in &prs {
                if args.dry_run {
                    println!("Would dispatch PR #{} in {}", pr.number, repo);
                    continue;
                }
                let payload = DispatchPayload {
                    pull_request: minimal_pull_request(pr),
                    owner: repo.owner.clone(),
                    repository: repo.name.clone(),
                };
                let payload = serde_json::to_value(&payload)?;
                github
                    .create_dispatch(token, repo, "pull_request", &payload)
                    .await
                    .with_context(|| {
                        format!("Failed to dispatch PR #{} in {}", pr.number, repo)
                    })?;
                sent += 1;
                info!("Dispatched PR #{} in {}", pr.number, repo);
                backoff.wait(sent).await;
            }
        }
    }

    println!("Dispatched {} pull requests", sent);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Check(args) => run_check(args).await,
        Commands::Dispatch(args) => run_dispatch(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gatekeeper_core::{CheckState, GitRef, Reason};

    const POLICY: &str = r#"
approve:
  include:
    authors: ["dependabot[bot]"]
    branches:
      deps:
        prefix: dependabot/
        age: 1 hour
merge:
  include:
    branches:
      deps:
        prefix: dependabot/
        required_statuses: ["build"]
"#;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn fixture() -> FixturePullRequest {
        FixturePullRequest::new("dependabot[bot]", "dependabot/cargo/serde")
            .with_created_at(now() - chrono::Duration::hours(3))
    }

    #[test]
    fn test_cli_parses_check() {
        let cli = Cli::try_parse_from([
            "gatekeeper",
            "check",
            "--policy",
            "gatekeeper.yml",
            "--pull-request",
            "pr.json",
            "--kind",
            "merge",
            "--live",
            "--now",
            "2024-05-01T12:00:00Z",
        ])
        .unwrap();
        match cli.command {
            Commands::Check(args) => {
                assert_eq!(args.kind, Kind::Merge);
                assert!(args.live);
                assert!(!args.fail_fast);
                assert_eq!(args.now, Some(now()));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_dispatch() {
        let cli = Cli::try_parse_from([
            "gatekeeper",
            "dispatch",
            "--repo",
            "octo/a",
            "--repo",
            "octo/b",
            "--token",
            "t",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Dispatch(args) => {
                assert_eq!(args.repos, vec!["octo/a", "octo/b"]);
                assert!(args.dry_run);
                assert_eq!(args.api_url, DEFAULT_API_URL);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_repos() {
        let repos = parse_repos(&["octo/a".to_string()]).unwrap();
        assert_eq!(repos, vec![RepoRef::new("octo", "a")]);
        assert!(parse_repos(&["octo".to_string()]).is_err());
    }

    #[test]
    fn test_minimal_pull_request_keeps_refs() {
        let pr = PullRequest {
            number: 9,
            state: "open".to_string(),
            head: GitRef::new("dependabot/x", "abc"),
            base: GitRef::new("main", "def"),
            merged: false,
            ..Default::default()
        };
        let minimal = minimal_pull_request(&pr);
        assert_eq!(minimal.number, 9);
        assert_eq!(minimal.head, pr.head);
        assert!(minimal.labels.is_empty());
    }

    #[tokio::test]
    async fn test_evaluate_conditions_only() {
        let policy = PolicyConfig::from_yaml(POLICY).unwrap();
        let validator = PolicyValidator::new(false).at(now());

        let outcome = evaluate(&policy, &fixture(), PolicyKind::Approve, validator, false).await;
        assert!(outcome.success, "{:?}", outcome.results);

        let young = fixture().with_created_at(now() - chrono::Duration::minutes(10));
        let outcome = evaluate(&policy, &young, PolicyKind::Approve, validator, false).await;
        assert!(!outcome.success);
        assert_eq!(outcome.results[0].reason, Reason::Age);
    }

    #[tokio::test]
    async fn test_evaluate_live_checks_statuses() {
        let policy = PolicyConfig::from_yaml(POLICY).unwrap();
        let validator = PolicyValidator::new(false).at(now());

        // Conditions alone pass without statuses.
        let outcome = evaluate(&policy, &fixture(), PolicyKind::Merge, validator, false).await;
        assert!(outcome.success);

        let outcome = evaluate(&policy, &fixture(), PolicyKind::Merge, validator, true).await;
        assert!(!outcome.success);
        assert_eq!(outcome.results[0].reason, Reason::Statuses);

        let green = fixture().with_check("build", CheckState::Success);
        let outcome = evaluate(&policy, &green, PolicyKind::Merge, validator, true).await;
        assert!(outcome.success);
    }
}
