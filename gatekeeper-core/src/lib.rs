pub mod backoff;
pub mod checks;
pub mod duration;
pub mod facts;
pub mod fixture;
pub mod policy;
pub mod retry;
pub mod validation;
pub mod validator;

pub use backoff::DispatchBackoff;
pub use checks::Check;
pub use duration::{parse_duration, PolicyDuration};
pub use facts::{
    combined_state, CheckState, CheckStatus, CombinedState, GitRef, PrComment, PullRequestFacts,
};
pub use fixture::FixturePullRequest;
pub use policy::{
    resolve_merge_method, BranchRule, CommentRule, Include, MergeCapabilities, MergeMethod,
    PolicyConfig,
};
pub use retry::{Attempt, RetryPolicy};
pub use validation::{PolicyKind, Reason, ValidationOutcome, ValidationResult};
pub use validator::{match_branches, MatchedBranch, PolicyValidator};
