//! Phase node contract and the agent-backed node used by most phases.

use super::prompts;
use super::state::{RunState, StateUpdate};
use crate::agent::{AgentExecutor, AgentOptions};
use crate::gates::GateContext;
use crate::ledger::RejectionFeedbackLog;
use crate::phase::Phase;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// One phase of the graph.
///
/// `execute` is the primary work and is wrapped in auto-fix by the engine.
/// A node that needs work after its approval gate (merge) returns `true`
/// from `has_finalize` and implements `finalize`.
#[async_trait]
pub trait PhaseNode: Send + Sync {
    fn phase(&self) -> Phase;

    async fn execute(&self, state: &RunState) -> Result<StateUpdate>;

    /// Summary shown to the reviewer when the gate after this phase suspends.
    async fn gate_context(&self, state: &RunState) -> Result<GateContext> {
        Ok(GateContext::artifact(self.phase(), state))
    }

    fn has_finalize(&self) -> bool {
        false
    }

    async fn finalize(&self, _state: &RunState) -> Result<StateUpdate> {
        Ok(StateUpdate::default())
    }
}

/// Runs a phase by prompting the coding agent and storing its reply as the
/// phase artifact.
pub struct AgentPhaseNode {
    phase: Phase,
    agent: Arc<dyn AgentExecutor>,
    feedback: RejectionFeedbackLog,
}

impl AgentPhaseNode {
    pub fn new(phase: Phase, agent: Arc<dyn AgentExecutor>, feedback: RejectionFeedbackLog) -> Self {
        Self { phase, agent, feedback }
    }
}

#[async_trait]
impl PhaseNode for AgentPhaseNode {
    fn phase(&self) -> Phase {
        self.phase
    }

    async fn execute(&self, state: &RunState) -> Result<StateUpdate> {
        let feedback = self
            .feedback
            .render(&state.spec_dir, self.phase)
            .context("Failed to load rejection feedback")?;
        let prompt = prompts::phase_prompt(self.phase, state, &feedback);
        let options = AgentOptions::new(&state.worktree_path, self.phase.as_str());

        let output = self
            .agent
            .execute(&prompt, &options)
            .await
            .with_context(|| format!("Agent invocation for {} failed", self.phase))?;
        if !output.success() {
            anyhow::bail!(
                "Agent exited with code {} during {}: {}",
                output.exit_code,
                self.phase,
                output.result.trim()
            );
        }

        info!(phase = %self.phase, feature_id = %state.feature_id, chars = output.result.len(), "phase artifact produced");
        Ok(StateUpdate::default()
            .artifact(self.phase, output.result)
            .messages(format!("{} completed", self.phase.title())))
    }
}
