//! Persisted records: features and agent runs.
//!
//! The engine writes these as a run progresses; the watchers poll them.

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryAgentRunRepository, MemoryFeatureRepository};
pub use sqlite::{SqliteHandle, SqliteStore};

use crate::git::{CiStatus, PrState};
use crate::phase::Phase;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Where a feature stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Started,
    Analyze,
    Requirements,
    Research,
    Planning,
    Implementation,
    Review,
    Maintain,
    Blocked,
}

impl Lifecycle {
    /// Lifecycle a feature enters when `phase` starts running.
    pub fn for_phase(phase: Phase) -> Lifecycle {
        match phase {
            Phase::Analyze => Self::Analyze,
            Phase::Requirements => Self::Requirements,
            Phase::Research => Self::Research,
            Phase::Plan => Self::Planning,
            Phase::Implement => Self::Implementation,
            Phase::Merge => Self::Review,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Analyze => "analyze",
            Self::Requirements => "requirements",
            Self::Research => "research",
            Self::Planning => "planning",
            Self::Implementation => "implementation",
            Self::Review => "review",
            Self::Maintain => "maintain",
            Self::Blocked => "blocked",
        }
    }
}

/// Pull request fields recorded on a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub url: Option<String>,
    pub number: Option<u64>,
    pub status: PrState,
    pub ci_status: Option<CiStatus>,
    pub commit_hash: Option<String>,
}

impl PullRequest {
    pub fn open() -> Self {
        Self {
            url: None,
            number: None,
            status: PrState::Open,
            ci_status: None,
            commit_hash: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub name: String,
    pub repository_path: PathBuf,
    pub branch: Option<String>,
    pub lifecycle: Lifecycle,
    pub worktree_path: Option<PathBuf>,
    pub spec_dir: Option<PathBuf>,
    pub pr: Option<PullRequest>,
    pub updated_at: DateTime<Utc>,
}

impl Feature {
    pub fn new(id: impl Into<String>, name: impl Into<String>, repository_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            repository_path: repository_path.into(),
            branch: None,
            lifecycle: Lifecycle::Started,
            worktree_path: None,
            spec_dir: None,
            pr: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// The PR record, created as open if the feature has none yet.
    pub fn pr_mut(&mut self) -> &mut PullRequest {
        self.pr.get_or_insert_with(PullRequest::open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
}

impl AgentRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for AgentRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid agent run status: {}", s)),
        }
    }
}

/// One engine run (one run id) for a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub feature_id: String,
    pub status: AgentRunStatus,
    pub current_phase: Option<Phase>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRun {
    pub fn new(id: impl Into<String>, feature_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            feature_id: feature_id.into(),
            status: AgentRunStatus::Pending,
            current_phase: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait FeatureRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Feature>>;

    /// Insert or replace the feature record.
    async fn update(&self, feature: &Feature) -> Result<()>;

    async fn list(&self) -> Result<Vec<Feature>>;
}

#[async_trait]
pub trait AgentRunRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<AgentRun>>;

    async fn upsert(&self, run: &AgentRun) -> Result<()>;

    async fn list(&self) -> Result<Vec<AgentRun>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_for_phase() {
        assert_eq!(Lifecycle::for_phase(Phase::Plan), Lifecycle::Planning);
        assert_eq!(Lifecycle::for_phase(Phase::Implement), Lifecycle::Implementation);
        assert_eq!(Lifecycle::for_phase(Phase::Merge), Lifecycle::Review);
    }

    #[test]
    fn test_run_status_round_trips_through_str() {
        for status in [
            AgentRunStatus::Pending,
            AgentRunStatus::Running,
            AgentRunStatus::WaitingApproval,
            AgentRunStatus::Completed,
            AgentRunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<AgentRunStatus>(), Ok(status));
        }
        assert!("paused".parse::<AgentRunStatus>().is_err());
    }

    #[test]
    fn test_pr_mut_creates_open_record() {
        let mut feature = Feature::new("f", "Login", "/repo");
        feature.pr_mut().number = Some(12);
        let pr = feature.pr.unwrap();
        assert_eq!(pr.status, PrState::Open);
        assert_eq!(pr.number, Some(12));
    }
}
