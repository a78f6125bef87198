pub mod config;
pub mod dispatch;
pub mod error;
pub mod facts;
pub mod github;
pub mod operations;
pub mod policy_source;
pub mod queue;
pub mod recording;
pub mod review;
pub mod templates;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

pub use dispatch::{Dispatched, ReviewDispatcher, ReviewerMode};
pub use error::ReviewError;
pub use github::{GitHubClient, InstallationConnector};
pub use operations::{
    EventMeta, GitHubConnector, GitHubOperations, PullRequest, RepoRef, Repository,
};
pub use policy_source::{LocalPolicySource, PolicySource, RepositoryPolicySource};
pub use queue::{EventEnvelope, EventHandler, QueueError, RepositoryEventQueue};
pub use recording::RecordingLogger;
pub use review::{ReviewOrchestrator, ReviewOutcome, ReviewSettings};
pub use webhook::DispatchPayload;

pub fn get_bot_version() -> String {
    // Git hash injected by the release build, if any
    match option_env!("GATEKEEPER_GIT_HASH") {
        Some(git_hash) if git_hash.len() >= 8 => git_hash[..8].to_string(),
        Some(git_hash) => git_hash.to_string(),
        None => env!("CARGO_PKG_VERSION").to_string(),
    }
}

pub struct AppState {
    pub webhook_secret: String,
    pub dispatcher: Arc<ReviewDispatcher>,
    pub policy_source: Arc<dyn PolicySource>,
    pub recording_logger: Option<RecordingLogger>,
}
