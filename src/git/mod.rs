//! Interface to the git / pull-request / CI service.
//!
//! The engine never shells out to git or `gh` itself; it drives an
//! implementation of [`GitPrService`]. Every method fails with a
//! [`GitPrError`] carrying one of the closed error codes.

use crate::errors::GitPrError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Conclusion of a CI run (or the aggregate check state of a PR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    Pending,
    Success,
    Failure,
}

impl fmt::Display for CiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// State of a pull request on the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

impl fmt::Display for PrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Merged => write!(f, "merged"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// The latest CI run detected for a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiRun {
    pub id: String,
    pub status: CiStatus,
    pub url: Option<String>,
}

/// A pull request as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub url: String,
}

/// One row of a repository-wide PR status listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrStatusInfo {
    pub number: u64,
    pub url: String,
    pub state: PrState,
    pub head_branch: String,
    pub ci_status: Option<CiStatus>,
}

/// Diff statistics between the feature branch and its base.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

/// How a pull request gets merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Squash,
    Merge,
    Rebase,
}

/// Git, pull-request and CI operations the engine depends on.
#[async_trait]
pub trait GitPrService: Send + Sync {
    async fn has_remote(&self, repo: &Path) -> Result<bool, GitPrError>;

    async fn default_branch(&self, repo: &Path) -> Result<String, GitPrError>;

    /// Stage and commit everything; returns the new commit hash.
    async fn commit_all(&self, cwd: &Path, message: &str) -> Result<String, GitPrError>;

    async fn push(&self, cwd: &Path, branch: &str, set_upstream: bool) -> Result<(), GitPrError>;

    async fn create_pr(&self, cwd: &Path, title: &str, body: &str, base: &str) -> Result<PrInfo, GitPrError>;

    async fn merge_pr(&self, cwd: &Path, pr_number: u64, strategy: MergeStrategy) -> Result<(), GitPrError>;

    async fn merge_branch(&self, repo: &Path, source: &str, target: &str) -> Result<(), GitPrError>;

    /// Latest CI run for `branch`, or `None` when no run has been detected.
    async fn ci_status(&self, cwd: &Path, branch: &str) -> Result<Option<CiRun>, GitPrError>;

    /// Block until the run concludes; fails with `CI_TIMEOUT` on expiry.
    async fn watch_ci(&self, cwd: &Path, run_id: &str, timeout: Duration) -> Result<CiStatus, GitPrError>;

    async fn failure_logs(&self, cwd: &Path, run_id: &str, max_chars: usize) -> Result<String, GitPrError>;

    /// Whether `branch` is an ancestor of `base` in `repo`.
    async fn verify_merge(&self, repo: &Path, branch: &str, base: &str) -> Result<bool, GitPrError>;

    async fn diff_summary(&self, cwd: &Path, base: &str) -> Result<DiffSummary, GitPrError>;

    async fn list_pr_statuses(&self, repo: &Path) -> Result<Vec<PrStatusInfo>, GitPrError>;
}
