//! Watch CI for the feature branch and ask the agent to fix failures.

use super::persist_feature;
use crate::agent::{AgentExecutor, AgentOptions};
use crate::config::CiConfig;
use crate::errors::CiFixError;
use crate::git::{CiRun, CiStatus, GitPrService, PrState};
use crate::orchestrator::prompts;
use crate::orchestrator::state::{FixAttemptRecord, FixOutcome, FixStatus, RunState, StateUpdate};
use crate::store::FeatureRepository;
use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use tracing::{info, warn};

pub const CI_FIX_LABEL: &str = "ci-fix";
pub const TRUNCATION_MARKER: &str = "[... truncated]";

/// Cap `logs` at `max_chars`, appending an explicit marker when cut.
pub fn truncate_logs(logs: &str, max_chars: usize) -> String {
    match logs.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}\n{}", &logs[..idx], TRUNCATION_MARKER),
        None => logs.to_string(),
    }
}

/// Outcome of a CI loop that ended with passing CI (or found no CI at all).
#[derive(Debug, Clone, PartialEq)]
pub struct CiLoopOutcome {
    /// `None` when no CI run was detected for the branch.
    pub ci_status: Option<CiStatus>,
    pub attempts: u32,
    pub fix_status: FixStatus,
    pub history: Vec<FixAttemptRecord>,
}

impl CiLoopOutcome {
    pub fn into_update(self) -> StateUpdate {
        let mut update = StateUpdate::default()
            .ci_status(self.ci_status)
            .ci_fix_attempts(self.attempts)
            .ci_fix_status(self.fix_status);
        update.ci_fix_history = self.history;
        update
    }
}

enum Watch {
    Concluded(CiStatus),
    TimedOut,
}

pub struct CiFixLoop<'a> {
    pub git: &'a dyn GitPrService,
    pub agent: &'a dyn AgentExecutor,
    pub features: &'a dyn FeatureRepository,
    pub config: &'a CiConfig,
}

impl CiFixLoop<'_> {
    /// Run the watch/fix loop for `branch`.
    ///
    /// Exhaustion and watch timeouts persist the failure on the feature
    /// record first, then fail with a `CiFixError`.
    pub async fn run(&self, state: &RunState, branch: &str) -> Result<CiLoopOutcome> {
        let cwd = state.worktree_path.as_path();
        let Some(mut run) = self.git.ci_status(cwd, branch).await? else {
            info!(branch, "no CI run detected; skipping CI loop");
            return Ok(CiLoopOutcome {
                ci_status: None,
                attempts: 0,
                fix_status: FixStatus::Idle,
                history: Vec::new(),
            });
        };

        let max = self.config.max_fix_attempts;
        let mut attempts = 0;
        let mut history = Vec::new();
        let mut watch = self.watch(cwd, &run).await?;

        loop {
            match watch {
                Watch::Concluded(CiStatus::Success) => {
                    info!(branch, attempts, "CI passed");
                    return Ok(CiLoopOutcome {
                        ci_status: Some(CiStatus::Success),
                        attempts,
                        fix_status: if attempts > 0 { FixStatus::Success } else { FixStatus::Idle },
                        history,
                    });
                }
                Watch::TimedOut => {
                    return Err(self
                        .terminal(state, FixStatus::Timeout, attempts, history)
                        .await);
                }
                Watch::Concluded(_) => {}
            }

            if attempts >= max {
                return Err(self
                    .terminal(state, FixStatus::Exhausted, attempts, history)
                    .await);
            }
            attempts += 1;
            let started_at = Utc::now();

            let logs = match self
                .git
                .failure_logs(cwd, &run.id, self.config.failure_log_max_chars)
                .await
            {
                Ok(logs) => truncate_logs(&logs, self.config.failure_log_max_chars),
                Err(e) => {
                    warn!(branch, run_id = %run.id, error = %e, "could not fetch CI failure logs");
                    format!("(failure logs unavailable: {})", e)
                }
            };

            warn!(branch, attempt = attempts, max, "CI failed; requesting fix");
            let prompt = prompts::ci_fix_prompt(branch, attempts, max, &logs);
            if let Err(e) = self
                .agent
                .execute(&prompt, &AgentOptions::new(cwd, CI_FIX_LABEL))
                .await
            {
                warn!(branch, attempt = attempts, error = %format!("{:#}", e), "CI fix dispatch failed");
                history.push(FixAttemptRecord::new(attempts, CI_FIX_LABEL, started_at, &logs, FixOutcome::Failed));
                continue;
            }

            match self.repoll(cwd, branch, &run.id).await {
                Some(next) => {
                    run = next;
                    watch = self.watch(cwd, &run).await?;
                }
                None => {
                    warn!(branch, attempt = attempts, "no new CI run appeared after fix");
                    watch = Watch::Concluded(CiStatus::Failure);
                }
            }

            let outcome = match watch {
                Watch::Concluded(CiStatus::Success) => FixOutcome::Fixed,
                Watch::Concluded(_) => FixOutcome::Failed,
                Watch::TimedOut => FixOutcome::Timeout,
            };
            history.push(FixAttemptRecord::new(attempts, CI_FIX_LABEL, started_at, &logs, outcome));
        }
    }

    async fn watch(&self, cwd: &Path, run: &CiRun) -> Result<Watch> {
        match self.git.watch_ci(cwd, &run.id, self.config.watch_timeout()).await {
            Ok(CiStatus::Pending) => Ok(Watch::TimedOut),
            Ok(status) => Ok(Watch::Concluded(status)),
            Err(e) if e.is_timeout() => {
                warn!(run_id = %run.id, "CI watch timed out");
                Ok(Watch::TimedOut)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until a run other than `previous_id` shows up.
    async fn repoll(&self, cwd: &Path, branch: &str, previous_id: &str) -> Option<CiRun> {
        for _ in 0..self.config.repoll_attempts {
            tokio::time::sleep(self.config.poll_interval()).await;
            match self.git.ci_status(cwd, branch).await {
                Ok(Some(run)) if run.id != previous_id => return Some(run),
                Ok(_) => {}
                Err(e) => warn!(branch, error = %e, "CI status poll failed"),
            }
        }
        None
    }

    async fn terminal(
        &self,
        state: &RunState,
        status: FixStatus,
        attempts: u32,
        history: Vec<FixAttemptRecord>,
    ) -> anyhow::Error {
        let result = persist_feature(self.features, state, |feature| {
            let pr = feature.pr_mut();
            pr.status = PrState::Open;
            pr.ci_status = Some(CiStatus::Failure);
            if state.pr_url.is_some() {
                pr.url = state.pr_url.clone();
            }
            if state.pr_number.is_some() {
                pr.number = state.pr_number;
            }
            if state.commit_hash.is_some() {
                pr.commit_hash = state.commit_hash.clone();
            }
        })
        .await;
        if let Err(e) = result {
            warn!(feature_id = %state.feature_id, error = %format!("{:#}", e), "failed to persist CI failure");
        }

        warn!(feature_id = %state.feature_id, status = %status, attempts, "CI loop ended without passing CI");
        CiFixError {
            status,
            attempts,
            history,
        }
        .into()
    }
}
