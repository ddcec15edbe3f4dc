//! Platform-neutral hosting provider interface for the finalize flow.
//!
//! Two concrete instantiations: GitHub (octocrab) and GitLab (REST via
//! reqwest). Merging is always server-side — the engine never checks out
//! the target branch locally.

pub mod github;
pub mod gitlab;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use orc_core::config::MergeMethod;

pub use github::GithubProvider;
pub use gitlab::GitlabProvider;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("missing hosting token")]
    MissingToken,

    #[error("API error: {0}")]
    Api(String),

    #[error("GitHub error: {0}")]
    GitHub(#[from] octocrab::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Provider-neutral pull/merge request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub head_sha: Option<String>,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct PrSpec {
    pub title: String,
    pub body: String,
    /// Source branch.
    pub head: String,
    /// Target branch.
    pub base: String,
    pub draft: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Pending,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: CheckStatus,
}

// ---------------------------------------------------------------------------
// HostingProvider
// ---------------------------------------------------------------------------

#[async_trait]
pub trait HostingProvider: Send + Sync {
    async fn create_pr(&self, spec: &PrSpec) -> Result<PullRequest>;

    async fn update_pr(
        &self,
        number: u64,
        title: Option<&str>,
        body: Option<&str>,
    ) -> Result<PullRequest>;

    /// An open PR whose source branch is `head`, if any.
    async fn find_open_pr(&self, head: &str) -> Result<Option<PullRequest>>;

    async fn request_reviews(&self, number: u64, reviewers: &[String]) -> Result<()>;

    async fn add_assignees(&self, number: u64, assignees: &[String]) -> Result<()>;

    /// Labels that do not exist on the host are silently skipped.
    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<()>;

    async fn get_checks(&self, number: u64) -> Result<Vec<CheckRun>>;

    /// Server-side merge. When `expected_head_sha` is given, the host
    /// refuses the merge if the branch moved — this prevents races with
    /// concurrent pushes.
    async fn merge(
        &self,
        number: u64,
        method: MergeMethod,
        expected_head_sha: Option<&str>,
    ) -> Result<()>;

    async fn delete_branch(&self, branch: &str) -> Result<()>;
}

/// True when every check is terminal and none failed.
pub fn checks_green(checks: &[CheckRun]) -> bool {
    checks.iter().all(|c| {
        matches!(
            c.status,
            CheckStatus::Pass | CheckStatus::Skipped
        )
    })
}

/// True while any check is still pending.
pub fn checks_pending(checks: &[CheckRun]) -> bool {
    checks.iter().any(|c| c.status == CheckStatus::Pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(status: CheckStatus) -> CheckRun {
        CheckRun {
            name: "ci".into(),
            status,
        }
    }

    #[test]
    fn green_requires_all_terminal_success() {
        assert!(checks_green(&[run(CheckStatus::Pass), run(CheckStatus::Skipped)]));
        assert!(!checks_green(&[run(CheckStatus::Pass), run(CheckStatus::Fail)]));
        assert!(!checks_green(&[run(CheckStatus::Pending)]));
        assert!(checks_green(&[]));
    }

    #[test]
    fn pending_detection() {
        assert!(checks_pending(&[run(CheckStatus::Pass), run(CheckStatus::Pending)]));
        assert!(!checks_pending(&[run(CheckStatus::Cancelled)]));
    }
}
