//! Typed error hierarchy for the flow engine.
//!
//! - `EngineError`: run-level failures returned from `ExecutionEngine::invoke`
//! - `AgentError`: failures of the external coding-agent process
//! - `GitPrError`: failures of the git / PR / CI service, tagged with a closed code set
//! - `CiFixError`: terminal outcome of the merge CI watch/fix loop
//! - `MergeError`: merge verification failures

use crate::orchestrator::state::{FixAttemptRecord, FixStatus};
use crate::phase::Phase;
use std::fmt;
use thiserror::Error;

/// Errors from the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Run {run_id} already has an invocation in flight")]
    RunBusy { run_id: String },

    #[error("Run {run_id} has no checkpoint to resume from")]
    UnknownRun { run_id: String },

    #[error("Run {run_id} is not awaiting approval (position: {position})")]
    NotAwaitingApproval { run_id: String, position: String },

    #[error("Rejection limit of {limit} reached for phase {phase}")]
    RejectionLimit { phase: Phase, limit: u32 },

    #[error("Phase {phase} failed: {source:#}")]
    NodeFailed {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    #[error("Checkpoint store error: {0:#}")]
    Checkpoint(#[source] anyhow::Error),

    #[error("Phase ledger error: {0:#}")]
    Ledger(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the agent executor.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent process timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Agent process I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Closed set of error codes surfaced by the git / PR / CI service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitPrErrorCode {
    MergeConflict,
    AuthFailure,
    CiTimeout,
    NotFound,
    GhNotFound,
    GitError,
}

impl GitPrErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MergeConflict => "MERGE_CONFLICT",
            Self::AuthFailure => "AUTH_FAILURE",
            Self::CiTimeout => "CI_TIMEOUT",
            Self::NotFound => "NOT_FOUND",
            Self::GhNotFound => "GH_NOT_FOUND",
            Self::GitError => "GIT_ERROR",
        }
    }
}

impl fmt::Display for GitPrErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error from the git / PR / CI service.
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct GitPrError {
    pub code: GitPrErrorCode,
    pub message: String,
}

impl GitPrError {
    pub fn new(code: GitPrErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.code == GitPrErrorCode::CiTimeout
    }
}

/// The CI watch/fix loop ended without a passing run.
#[derive(Debug, Error)]
#[error("CI fix loop ended with status {status} after {attempts} attempt(s){}", render_history(.history))]
pub struct CiFixError {
    pub status: FixStatus,
    pub attempts: u32,
    pub history: Vec<FixAttemptRecord>,
}

fn render_history(history: &[FixAttemptRecord]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = history
        .iter()
        .map(|r| format!("#{} {}: {}", r.attempt, r.outcome, r.summary))
        .collect();
    format!(" [{}]", lines.join("; "))
}

/// Errors raised by the merge step itself.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Merge of {branch} into {base} could not be verified in {repository}")]
    VerificationFailed {
        branch: String,
        base: String,
        repository: String,
    },

    #[error("Failed to persist feature {feature_id}: {message}")]
    FeatureStore { feature_id: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::state::FixOutcome;
    use chrono::Utc;

    #[test]
    fn git_pr_error_display_carries_code() {
        let err = GitPrError::new(GitPrErrorCode::AuthFailure, "token expired");
        assert_eq!(err.to_string(), "[AUTH_FAILURE] token expired");
        assert!(!err.is_timeout());
        assert!(GitPrError::new(GitPrErrorCode::CiTimeout, "slow").is_timeout());
    }

    #[test]
    fn ci_fix_error_names_attempt_count_and_history() {
        let err = CiFixError {
            status: FixStatus::Exhausted,
            attempts: 3,
            history: vec![FixAttemptRecord {
                attempt: 1,
                name: "ci".into(),
                started_at: Utc::now(),
                summary: "lint failed".into(),
                outcome: FixOutcome::Failed,
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("exhausted"));
        assert!(msg.contains("3 attempt(s)"));
        assert!(msg.contains("#1 failed: lint failed"));
    }

    #[test]
    fn engine_error_node_failed_is_matchable() {
        let err = EngineError::NodeFailed {
            phase: Phase::Plan,
            source: anyhow::anyhow!("boom"),
        };
        match &err {
            EngineError::NodeFailed { phase, .. } => assert_eq!(*phase, Phase::Plan),
            _ => panic!("Expected NodeFailed"),
        }
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&EngineError::UnknownRun { run_id: "r".into() });
        assert_std_error(&AgentError::Timeout { secs: 1 });
        assert_std_error(&GitPrError::new(GitPrErrorCode::GitError, "x"));
        assert_std_error(&MergeError::VerificationFailed {
            branch: "b".into(),
            base: "main".into(),
            repository: "/repo".into(),
        });
        assert_std_error(&MergeError::FeatureStore {
            feature_id: "login".into(),
            message: "database is locked".into(),
        });
    }
}
