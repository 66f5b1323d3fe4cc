//! Bounded self-repair around a phase's primary work.
//!
//! A failing phase is classified first. Non-fixable errors propagate at once.
//! Fixable errors get up to `max_attempts` rounds of "ask the agent to fix,
//! then retry". A retry that fails with a non-fixable error ends the loop.
//! Suspend requests (`Interrupt`) are never classified.

use super::prompts;
use super::state::{FixAttemptRecord, FixOutcome, FixStatus, StateUpdate};
use crate::agent::{AgentExecutor, AgentOptions};
use crate::config::AutoFixConfig;
use crate::errors::{AgentError, CiFixError, GitPrError, GitPrErrorCode, MergeError};
use crate::gates::as_interrupt;
use crate::phase::Phase;
use anyhow::Result;
use chrono::Utc;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Fixable,
    NonFixable,
}

const NON_FIXABLE_PATTERNS: &[&str] = &[
    "permission denied",
    "eacces",
    "eperm",
    "authentication",
    "unauthorized",
    "forbidden",
    "rate limit",
    "quota",
    "no space left",
    "enospc",
    "connection refused",
    "network unreachable",
    "could not resolve host",
    "command not found",
];

const FIXABLE_PATTERNS: &[&str] = &[
    "syntax error",
    "parse error",
    "unexpected token",
    "invalid yaml",
    "invalid json",
    "failed to parse",
    "missing field",
    "validation failed",
    "type error",
];

/// Classify an error by its type first, then by its message text.
/// Anything unrecognised is treated as fixable.
pub fn classify_error(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(git) = cause.downcast_ref::<GitPrError>() {
            return match git.code {
                GitPrErrorCode::MergeConflict | GitPrErrorCode::GitError => ErrorClass::Fixable,
                GitPrErrorCode::AuthFailure
                | GitPrErrorCode::CiTimeout
                | GitPrErrorCode::NotFound
                | GitPrErrorCode::GhNotFound => ErrorClass::NonFixable,
            };
        }
        if cause.downcast_ref::<CiFixError>().is_some() || cause.downcast_ref::<MergeError>().is_some() {
            return ErrorClass::NonFixable;
        }
        if let Some(AgentError::SpawnFailed { .. } | AgentError::Timeout { .. }) = cause.downcast_ref::<AgentError>() {
            return ErrorClass::NonFixable;
        }
    }

    let text = format!("{:#}", err).to_lowercase();
    if NON_FIXABLE_PATTERNS.iter().any(|p| text.contains(p)) {
        return ErrorClass::NonFixable;
    }
    if FIXABLE_PATTERNS.iter().any(|p| text.contains(p)) {
        return ErrorClass::Fixable;
    }
    ErrorClass::Fixable
}

/// Fix bookkeeping produced by one wrapped run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixBookkeeping {
    pub attempts: u32,
    pub status: FixStatus,
    pub history: Vec<FixAttemptRecord>,
}

impl FixBookkeeping {
    /// The matching state update. Runs that needed no fix leave the
    /// counters of the previously fixed node in place.
    pub fn into_update(self) -> StateUpdate {
        let mut update = StateUpdate::default();
        if self.attempts > 0 {
            update = update.node_fix_attempts(self.attempts).node_fix_status(self.status);
        }
        update.node_fix_history = self.history;
        update
    }
}

/// Failure of a wrapped run: the original error plus what was attempted.
#[derive(Debug)]
pub struct AutoFixError {
    pub error: anyhow::Error,
    pub bookkeeping: FixBookkeeping,
}

#[derive(Clone)]
pub struct NodeAutoFixWrapper {
    agent: Arc<dyn AgentExecutor>,
    enabled: bool,
    max_attempts: u32,
}

impl NodeAutoFixWrapper {
    pub fn new(agent: Arc<dyn AgentExecutor>, config: &AutoFixConfig) -> Self {
        Self {
            agent,
            enabled: config.enabled,
            max_attempts: config.max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `op`, repairing fixable failures. `cwd` is where fix prompts run.
    pub async fn run<T, F, Fut>(&self, phase: Phase, cwd: &Path, mut op: F) -> Result<(T, FixBookkeeping), AutoFixError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let original = match op().await {
            Ok(value) => return Ok((value, FixBookkeeping::default())),
            Err(e) => e,
        };

        let mut bookkeeping = FixBookkeeping::default();
        if as_interrupt(&original).is_some() {
            return Err(AutoFixError { error: original, bookkeeping });
        }
        if !self.enabled || classify_error(&original) == ErrorClass::NonFixable {
            info!(phase = %phase, error = %format!("{:#}", original), "error is not auto-fixable");
            return Err(AutoFixError { error: original, bookkeeping });
        }

        let mut last_error_text = format!("{:#}", original);
        for attempt in 1..=self.max_attempts {
            let started_at = Utc::now();
            bookkeeping.attempts = attempt;
            warn!(phase = %phase, attempt, max = self.max_attempts, "attempting auto-fix");

            let prompt = prompts::node_fix_prompt(phase, attempt, self.max_attempts, &last_error_text);
            let options = AgentOptions::new(cwd, format!("fix:{}", phase));
            let declined = match self.agent.execute(&prompt, &options).await {
                Ok(output) => output.unfixable_reason().map(str::to_string),
                Err(e) => Some(format!("fix dispatch failed: {:#}", e)),
            };
            if let Some(reason) = declined {
                info!(phase = %phase, attempt, reason = %reason, "auto-fix declined");
                bookkeeping.history.push(FixAttemptRecord::new(
                    attempt,
                    phase.as_str(),
                    started_at,
                    &last_error_text,
                    FixOutcome::Failed,
                ));
                bookkeeping.status = FixStatus::Exhausted;
                return Err(AutoFixError { error: original, bookkeeping });
            }

            match op().await {
                Ok(value) => {
                    bookkeeping.history.push(FixAttemptRecord::new(
                        attempt,
                        phase.as_str(),
                        started_at,
                        &last_error_text,
                        FixOutcome::Fixed,
                    ));
                    bookkeeping.status = FixStatus::Success;
                    info!(phase = %phase, attempt, "auto-fix succeeded");
                    return Ok((value, bookkeeping));
                }
                Err(retry_err) => {
                    bookkeeping.history.push(FixAttemptRecord::new(
                        attempt,
                        phase.as_str(),
                        started_at,
                        &last_error_text,
                        FixOutcome::Failed,
                    ));
                    if as_interrupt(&retry_err).is_some() {
                        return Err(AutoFixError { error: retry_err, bookkeeping });
                    }
                    if classify_error(&retry_err) == ErrorClass::NonFixable {
                        info!(phase = %phase, attempt, error = %format!("{:#}", retry_err), "retry hit a non-fixable error");
                        bookkeeping.status = FixStatus::Exhausted;
                        return Err(AutoFixError { error: retry_err, bookkeeping });
                    }
                    last_error_text = format!("{:#}", retry_err);
                }
            }
        }

        bookkeeping.status = FixStatus::Exhausted;
        warn!(phase = %phase, attempts = bookkeeping.attempts, "auto-fix attempts exhausted");
        Err(AutoFixError { error: original, bookkeeping })
    }
}
