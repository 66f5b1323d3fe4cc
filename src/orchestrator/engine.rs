//! The execution engine: drives a run through the phase graph.
//!
//! Every step ends with a checkpoint. A run suspends at an approval gate by
//! writing an `AwaitingApproval` checkpoint and returning
//! `InvokeOutcome::Suspended`; it continues only when `invoke` is called
//! again with a `ResumeCommand`. A node that raises `Interrupt` suspends at
//! `Interrupted` instead: its primary work did not finish, so any answer
//! re-enters the node rather than passing the gate. Failures leave the latest checkpoint at the
//! failing position so `InvokeInput::Retry` resumes exactly there.
//!
//! On entry to a node the phase ledger decides whether real work happens:
//!
//! | ledger has phase | rejection pending | action                       |
//! |------------------|-------------------|------------------------------|
//! | yes              | no                | skip, no external calls      |
//! | yes              | yes               | clear ledger entry, execute  |
//! | no               | -                 | execute                      |

use super::autofix::{AutoFixError, NodeAutoFixWrapper};
use super::graph::{GraphPosition, PhaseGraph};
use super::state::{RunState, StateUpdate};
use crate::checkpoint::CheckpointStore;
use crate::errors::{CiFixError, EngineError};
use crate::gates::{ApprovalAction, ApprovalGate, GateContext, InterruptPayload, ResumeCommand, as_interrupt};
use crate::ledger::{FeatureDocStore, PhaseLedger, RejectionFeedbackLog};
use crate::phase::Phase;
use crate::store::{AgentRun, AgentRunRepository, AgentRunStatus, FeatureRepository, Lifecycle};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What the caller hands to `invoke`.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeInput {
    /// Start a new run. If the run id already has checkpoints, the run is
    /// resumed from the latest one and this state is ignored.
    Start(RunState),
    /// Answer the approval gate the run is suspended at.
    Resume(ResumeCommand),
    /// Re-enter a failed or interrupted run at its latest checkpoint.
    Retry,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutcome {
    Completed(RunState),
    Suspended(InterruptPayload),
}

impl InvokeOutcome {
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }
}

/// Fresh identifier for a new run.
pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

enum NodeStep {
    Next(GraphPosition),
    Suspend(InterruptPayload),
}

struct ActiveRunGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    run_id: String,
}

impl Drop for ActiveRunGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.run_id);
        }
    }
}

pub struct ExecutionEngine {
    graph: PhaseGraph,
    checkpoints: Arc<dyn CheckpointStore>,
    ledger: PhaseLedger,
    feedback: RejectionFeedbackLog,
    autofix: NodeAutoFixWrapper,
    features: Arc<dyn FeatureRepository>,
    runs: Arc<dyn AgentRunRepository>,
    max_rejections: Option<u32>,
    active: Mutex<HashSet<String>>,
}

impl ExecutionEngine {
    pub fn new(
        graph: PhaseGraph,
        checkpoints: Arc<dyn CheckpointStore>,
        docs: Arc<dyn FeatureDocStore>,
        autofix: NodeAutoFixWrapper,
        features: Arc<dyn FeatureRepository>,
        runs: Arc<dyn AgentRunRepository>,
    ) -> Self {
        Self {
            graph,
            checkpoints,
            ledger: PhaseLedger::new(docs.clone()),
            feedback: RejectionFeedbackLog::new(docs),
            autofix,
            features,
            runs,
            max_rejections: None,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Cap the rejections accepted per phase. `None` means unbounded.
    pub fn with_max_rejections(mut self, limit: Option<u32>) -> Self {
        self.max_rejections = limit;
        self
    }

    pub fn ledger(&self) -> &PhaseLedger {
        &self.ledger
    }

    pub fn feedback(&self) -> &RejectionFeedbackLog {
        &self.feedback
    }

    /// State of the latest checkpoint, without executing anything.
    pub async fn latest_state(&self, run_id: &str) -> Result<Option<RunState>, EngineError> {
        let latest = self.checkpoints.latest(run_id).await.map_err(EngineError::Checkpoint)?;
        Ok(latest.map(|c| c.state))
    }

    /// The pending approval request, if the run is suspended.
    pub async fn pending_approval(&self, run_id: &str) -> Result<Option<InterruptPayload>, EngineError> {
        let latest = self.checkpoints.latest(run_id).await.map_err(EngineError::Checkpoint)?;
        Ok(latest
            .filter(|c| c.position.is_suspended())
            .and_then(|c| c.interrupt))
    }

    pub async fn invoke(&self, run_id: &str, input: InvokeInput) -> Result<InvokeOutcome, EngineError> {
        let _guard = self.acquire(run_id)?;
        let latest = self.checkpoints.latest(run_id).await.map_err(EngineError::Checkpoint)?;

        let (mut position, mut state, mut resume, stored_interrupt) = match (input, latest) {
            (InvokeInput::Start(initial), None) => {
                let entry = self.graph.entry();
                self.checkpoint(run_id, entry, &initial, None).await?;
                info!(run_id, feature_id = %initial.feature_id, "run started");
                (entry, initial, None, None)
            }
            (InvokeInput::Start(_), Some(cp)) => {
                info!(run_id, position = %cp.position, seq = cp.seq, "run already has checkpoints; resuming");
                (cp.position, cp.state, None, cp.interrupt)
            }
            (InvokeInput::Retry, Some(cp)) => {
                info!(run_id, position = %cp.position, seq = cp.seq, "retrying run from latest checkpoint");
                (cp.position, cp.state, None, cp.interrupt)
            }
            (InvokeInput::Resume(command), Some(cp)) => {
                if !cp.position.is_suspended() {
                    return Err(EngineError::NotAwaitingApproval {
                        run_id: run_id.to_string(),
                        position: cp.position.to_string(),
                    });
                }
                info!(run_id, position = %cp.position, action = %command.action(), "resuming suspended run");
                (cp.position, cp.state, Some((command, cp.seq)), cp.interrupt)
            }
            (InvokeInput::Retry | InvokeInput::Resume(_), None) => {
                return Err(EngineError::UnknownRun {
                    run_id: run_id.to_string(),
                });
            }
        };

        loop {
            match position {
                GraphPosition::Done => {
                    self.finish(run_id, &state).await;
                    return Ok(InvokeOutcome::Completed(state));
                }
                GraphPosition::Node(phase) => match self.run_node(run_id, phase, &mut state).await? {
                    NodeStep::Next(next) => position = next,
                    NodeStep::Suspend(payload) => return Ok(InvokeOutcome::Suspended(payload)),
                },
                GraphPosition::AwaitingApproval(phase) | GraphPosition::Interrupted(phase) => {
                    let Some((command, seq)) = resume.take() else {
                        let payload = match stored_interrupt.clone() {
                            Some(payload) => payload,
                            None => self.gate_payload(run_id, phase, &state).await?,
                        };
                        return Ok(InvokeOutcome::Suspended(payload));
                    };
                    // Identifies the suspension so a re-sent answer is recorded once.
                    let suspension = format!("{}:{}", run_id, seq);
                    position = if matches!(position, GraphPosition::Interrupted(_)) {
                        self.answer(run_id, phase, command, &suspension, &mut state).await?
                    } else {
                        self.decide(run_id, phase, command, &suspension, &mut state).await?
                    };
                }
                GraphPosition::Finalize(phase) => {
                    position = self.run_finalize(run_id, phase, &mut state).await?;
                }
            }
        }
    }

    fn acquire(&self, run_id: &str) -> Result<ActiveRunGuard<'_>, EngineError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| EngineError::Other(anyhow::anyhow!("active run registry poisoned")))?;
        if !active.insert(run_id.to_string()) {
            return Err(EngineError::RunBusy {
                run_id: run_id.to_string(),
            });
        }
        Ok(ActiveRunGuard {
            active: &self.active,
            run_id: run_id.to_string(),
        })
    }

    async fn run_node(&self, run_id: &str, phase: Phase, state: &mut RunState) -> Result<NodeStep, EngineError> {
        let pending = state.pending_rejection_for(phase);
        state.apply(StateUpdate::default().current_node(Some(phase)));
        self.enter_phase(run_id, phase, state).await;

        let node = self.graph.node(phase)?;
        let complete = self
            .ledger
            .is_complete(&state.spec_dir, phase)
            .map_err(EngineError::Ledger)?;

        if complete && !pending {
            info!(run_id, phase = %phase, "phase already complete; skipping");
            state.apply(StateUpdate::default().messages(format!("{} already complete, skipped", phase.title())));
        } else {
            if complete {
                let phases = self.ledger.clear(&state.spec_dir, phase).map_err(EngineError::Ledger)?;
                state.apply(StateUpdate::default().completed_phases(phases));
            }

            info!(run_id, phase = %phase, reexecution = pending, "executing phase");
            let snapshot: &RunState = state;
            let result = self
                .autofix
                .run(phase, &snapshot.worktree_path, || node.execute(snapshot))
                .await;

            match result {
                Ok((update, bookkeeping)) => {
                    state.apply(update);
                    state.apply(bookkeeping.into_update());
                }
                Err(AutoFixError { error, bookkeeping }) => {
                    state.apply(bookkeeping.into_update());
                    if let Some(interrupt) = as_interrupt(&error) {
                        let payload = InterruptPayload {
                            node: phase,
                            message: interrupt.message.clone(),
                            context: interrupt.context.clone(),
                            run_id: run_id.to_string(),
                            feature_id: state.feature_id.clone(),
                        };
                        return self
                            .suspend(run_id, GraphPosition::Interrupted(phase), state, payload)
                            .await;
                    }
                    return Err(self.fail(run_id, GraphPosition::Node(phase), phase, state, error).await);
                }
            }

            let phases = self
                .ledger
                .record_complete(&state.spec_dir, phase)
                .map_err(EngineError::Ledger)?;
            state.apply(StateUpdate::default().completed_phases(phases));
            if pending || state.approval_action.is_some() {
                state.apply(StateUpdate::cleared_controls());
            }
        }

        if ApprovalGate::requires_approval(phase, &state.approval_gates) {
            let payload = self.gate_payload(run_id, phase, state).await?;
            return self
                .suspend(run_id, GraphPosition::AwaitingApproval(phase), state, payload)
                .await;
        }

        let next = self.graph.after_gate(phase, state);
        self.checkpoint(run_id, next, state, None).await?;
        Ok(NodeStep::Next(next))
    }

    async fn gate_payload(&self, run_id: &str, phase: Phase, state: &RunState) -> Result<InterruptPayload, EngineError> {
        let node = self.graph.node(phase)?;
        let context = match node.gate_context(state).await {
            Ok(context) => context,
            Err(e) => {
                warn!(run_id, phase = %phase, error = %format!("{:#}", e), "gate context unavailable; using artifact preview");
                GateContext::artifact(phase, state)
            }
        };
        Ok(ApprovalGate::payload(run_id, phase, state, context))
    }

    async fn suspend(
        &self,
        run_id: &str,
        position: GraphPosition,
        state: &mut RunState,
        payload: InterruptPayload,
    ) -> Result<NodeStep, EngineError> {
        let phase = payload.node;
        let note = match position {
            GraphPosition::Interrupted(_) => format!("{} is waiting for an answer", phase.title()),
            _ => format!("Waiting for approval of {}", phase.title()),
        };
        state.apply(StateUpdate::default().messages(note));
        self.checkpoint(run_id, position, state, Some(&payload)).await?;
        self.record_run(run_id, state, AgentRunStatus::WaitingApproval, Some(phase), None)
            .await;
        info!(run_id, position = %position, "run suspended");
        Ok(NodeStep::Suspend(payload))
    }

    async fn decide(
        &self,
        run_id: &str,
        phase: Phase,
        command: ResumeCommand,
        suspension: &str,
        state: &mut RunState,
    ) -> Result<GraphPosition, EngineError> {
        match command {
            ResumeCommand::Approved => {
                let phases = self
                    .ledger
                    .record_complete(&state.spec_dir, phase)
                    .map_err(EngineError::Ledger)?;
                state.apply(
                    StateUpdate::cleared_controls()
                        .completed_phases(phases)
                        .messages(format!("{} approved", phase.title())),
                );
                info!(run_id, phase = %phase, "gate approved");
                let next = self.graph.after_gate(phase, state);
                self.checkpoint(run_id, next, state, None).await?;
                Ok(next)
            }
            ResumeCommand::Rejected { feedback } => self.reject(run_id, phase, feedback, suspension, state).await,
        }
    }

    /// Answer to a question a node raised mid-execution. The phase has not
    /// finished, so nothing is recorded in the ledger and the node runs again
    /// with the answer in `approval_action` / `rejection_feedback`.
    async fn answer(
        &self,
        run_id: &str,
        phase: Phase,
        command: ResumeCommand,
        suspension: &str,
        state: &mut RunState,
    ) -> Result<GraphPosition, EngineError> {
        match command {
            ResumeCommand::Approved => {
                state.apply(
                    StateUpdate::default()
                        .approval_action(Some(ApprovalAction::Approved))
                        .current_node(Some(phase))
                        .messages(format!("{} question answered", phase.title())),
                );
                info!(run_id, phase = %phase, "interrupt approved; re-entering phase");
                let next = GraphPosition::Node(phase);
                self.checkpoint(run_id, next, state, None).await?;
                Ok(next)
            }
            ResumeCommand::Rejected { feedback } => self.reject(run_id, phase, feedback, suspension, state).await,
        }
    }

    async fn reject(
        &self,
        run_id: &str,
        phase: Phase,
        feedback: String,
        suspension: &str,
        state: &mut RunState,
    ) -> Result<GraphPosition, EngineError> {
        let recorded = self
            .feedback
            .iteration_for(&state.spec_dir, suspension)
            .map_err(EngineError::Ledger)?;
        if recorded.is_none()
            && let Some(limit) = self.max_rejections
        {
            let prior = self
                .feedback
                .entries_for(&state.spec_dir, phase)
                .map_err(EngineError::Ledger)?
                .len();
            if prior >= limit as usize {
                warn!(run_id, phase = %phase, limit, "rejection limit reached; run stays suspended");
                return Err(EngineError::RejectionLimit { phase, limit });
            }
        }
        if recorded.is_some() {
            debug!(run_id, phase = %phase, suspension, "rejection already recorded for this suspension");
        }

        let iteration = self
            .feedback
            .append_once(&state.spec_dir, phase, &feedback, suspension)
            .map_err(EngineError::Ledger)?;
        let phases = self.ledger.clear(&state.spec_dir, phase).map_err(EngineError::Ledger)?;
        state.apply(
            StateUpdate::default()
                .completed_phases(phases)
                .approval_action(Some(ApprovalAction::Rejected))
                .rejection_feedback(Some(feedback))
                .needs_reexecution(true)
                .current_node(Some(phase))
                .messages(format!("{} rejected (iteration {})", phase.title(), iteration)),
        );
        info!(run_id, phase = %phase, iteration, "gate rejected; re-executing phase");
        let next = GraphPosition::Node(phase);
        self.checkpoint(run_id, next, state, None).await?;
        Ok(next)
    }

    async fn run_finalize(&self, run_id: &str, phase: Phase, state: &mut RunState) -> Result<GraphPosition, EngineError> {
        state.apply(StateUpdate::default().current_node(Some(phase)));
        self.record_run(run_id, state, AgentRunStatus::Running, Some(phase), None)
            .await;
        let node = self.graph.node(phase)?;

        let snapshot: &RunState = state;
        let result = self
            .autofix
            .run(phase, &snapshot.worktree_path, || node.finalize(snapshot))
            .await;
        match result {
            Ok((update, bookkeeping)) => {
                state.apply(update);
                state.apply(bookkeeping.into_update());
            }
            Err(AutoFixError { error, bookkeeping }) => {
                state.apply(bookkeeping.into_update());
                return Err(self.fail(run_id, GraphPosition::Finalize(phase), phase, state, error).await);
            }
        }

        let next = self.graph.next(phase, state);
        self.checkpoint(run_id, next, state, None).await?;
        Ok(next)
    }

    /// Persist failure bookkeeping at the failing position and build the error.
    async fn fail(
        &self,
        run_id: &str,
        position: GraphPosition,
        phase: Phase,
        state: &mut RunState,
        error: anyhow::Error,
    ) -> EngineError {
        if let Some(ci) = error.chain().find_map(|e| e.downcast_ref::<CiFixError>()) {
            let mut update = StateUpdate::default()
                .ci_fix_attempts(ci.attempts)
                .ci_fix_status(ci.status);
            update.ci_fix_history = ci.history.clone();
            state.apply(update);
        }
        let summary = format!("{:#}", error);
        state.apply(StateUpdate::default().messages(format!("{} failed: {}", phase.title(), summary)));
        error!(run_id, phase = %phase, error = %summary, "phase failed");

        if let Err(e) = self.checkpoints.append(run_id, position, state, None).await {
            warn!(run_id, error = %format!("{:#}", e), "failed to record failure checkpoint");
        }
        self.record_run(run_id, state, AgentRunStatus::Failed, Some(phase), Some(summary))
            .await;
        EngineError::NodeFailed { phase, source: error }
    }

    async fn checkpoint(
        &self,
        run_id: &str,
        position: GraphPosition,
        state: &RunState,
        interrupt: Option<&InterruptPayload>,
    ) -> Result<(), EngineError> {
        let cp = self
            .checkpoints
            .append(run_id, position, state, interrupt)
            .await
            .map_err(EngineError::Checkpoint)?;
        debug!(run_id, seq = cp.seq, position = %position, "checkpoint written");
        Ok(())
    }

    async fn enter_phase(&self, run_id: &str, phase: Phase, state: &RunState) {
        self.record_run(run_id, state, AgentRunStatus::Running, Some(phase), None)
            .await;
        let lifecycle = Lifecycle::for_phase(phase);
        match self.features.find_by_id(&state.feature_id).await {
            Ok(Some(mut feature)) if feature.lifecycle != lifecycle => {
                feature.lifecycle = lifecycle;
                feature.updated_at = Utc::now();
                if let Err(e) = self.features.update(&feature).await {
                    warn!(run_id, feature_id = %state.feature_id, error = %format!("{:#}", e), "failed to update feature lifecycle");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(run_id, feature_id = %state.feature_id, error = %format!("{:#}", e), "failed to load feature");
            }
        }
    }

    async fn finish(&self, run_id: &str, state: &RunState) {
        match self.features.find_by_id(&state.feature_id).await {
            Ok(Some(mut feature)) if feature.lifecycle != Lifecycle::Maintain && feature.lifecycle != Lifecycle::Review => {
                feature.lifecycle = Lifecycle::Review;
                feature.updated_at = Utc::now();
                if let Err(e) = self.features.update(&feature).await {
                    warn!(run_id, error = %format!("{:#}", e), "failed to update feature lifecycle");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(run_id, error = %format!("{:#}", e), "failed to load feature"),
        }
        self.record_run(run_id, state, AgentRunStatus::Completed, None, None)
            .await;
        info!(run_id, feature_id = %state.feature_id, "run completed");
    }

    /// Best-effort update of the run record; failures only log.
    async fn record_run(
        &self,
        run_id: &str,
        state: &RunState,
        status: AgentRunStatus,
        phase: Option<Phase>,
        error: Option<String>,
    ) {
        let existing = match self.runs.find_by_id(run_id).await {
            Ok(run) => run,
            Err(e) => {
                warn!(run_id, error = %format!("{:#}", e), "failed to load agent run");
                None
            }
        };
        let mut run = existing.unwrap_or_else(|| AgentRun::new(run_id, state.feature_id.clone()));
        run.status = status;
        if phase.is_some() {
            run.current_phase = phase;
        }
        run.error = error;
        run.updated_at = Utc::now();
        if let Err(e) = self.runs.upsert(&run).await {
            warn!(run_id, error = %format!("{:#}", e), "failed to persist agent run");
        }
    }
}
