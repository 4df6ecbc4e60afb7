//! Repository setup and bidirectional GitHub sync.

pub mod githost;
pub mod orchestrator;

pub use githost::{GitHost, GitHubHost, is_valid_github_token, parse_owner_repo_from_url};
pub use orchestrator::{
    ConflictResolution, MergeStrategy, PullOptions, PullReport, PushOptions, PushReport,
    SetupReport, SyncOrchestrator,
};
