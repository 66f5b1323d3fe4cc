//! Approval gates: the suspend/resume protocol around a phase boundary.
//!
//! A gated phase suspends after its primary work when the matching
//! `ApprovalGates` flag is `false`. The run stays inert until the caller
//! supplies exactly one `ResumeCommand`; the engine consumes it once and
//! either continues forward (approved) or loops back to re-run the phase
//! (rejected).

use crate::git::{CiStatus, DiffSummary};
use crate::orchestrator::state::{RunState, truncate_chars};
use crate::phase::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-feature autonomy flags. `true` proceeds autonomously, `false`
/// suspends for human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApprovalGates {
    #[serde(default)]
    pub allow_prd: bool,
    #[serde(default)]
    pub allow_plan: bool,
    #[serde(default)]
    pub allow_merge: bool,
}

impl ApprovalGates {
    /// Every gate requires human approval.
    pub fn all_manual() -> Self {
        Self::default()
    }

    /// Every gate proceeds without stopping.
    pub fn autonomous() -> Self {
        Self {
            allow_prd: true,
            allow_plan: true,
            allow_merge: true,
        }
    }

    pub fn allows(&self, kind: GateKind) -> bool {
        match kind {
            GateKind::Prd => self.allow_prd,
            GateKind::Plan => self.allow_plan,
            GateKind::Merge => self.allow_merge,
        }
    }
}

/// The three human checkpoints in the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Prd,
    Plan,
    Merge,
}

impl GateKind {
    /// The gate guarding the boundary after `phase`, if any.
    pub fn for_phase(phase: Phase) -> Option<GateKind> {
        match phase {
            Phase::Requirements => Some(GateKind::Prd),
            Phase::Plan => Some(GateKind::Plan),
            Phase::Merge => Some(GateKind::Merge),
            Phase::Analyze | Phase::Research | Phase::Implement => None,
        }
    }
}

/// Transient record of the last decision taken at a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approved,
    Rejected,
}

impl fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Resume decision supplied by the caller for a suspended run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResumeCommand {
    Approved,
    Rejected { feedback: String },
}

impl ResumeCommand {
    pub fn reject(feedback: impl Into<String>) -> Self {
        Self::Rejected {
            feedback: feedback.into(),
        }
    }

    pub fn action(&self) -> ApprovalAction {
        match self {
            Self::Approved => ApprovalAction::Approved,
            Self::Rejected { .. } => ApprovalAction::Rejected,
        }
    }
}

/// Contextual summary shown to the human reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateContext {
    /// A document-style artifact (requirements, plan).
    Artifact { phase: Phase, preview: String },
    /// The merge decision: what changed and where CI stands.
    Merge {
        diff: Option<DiffSummary>,
        pr_url: Option<String>,
        pr_number: Option<u64>,
        ci_status: Option<CiStatus>,
        commit_hash: Option<String>,
    },
}

/// Characters of an artifact shown in the suspend payload.
pub const ARTIFACT_PREVIEW_CHARS: usize = 2_000;

impl GateContext {
    pub fn artifact(phase: Phase, state: &RunState) -> Self {
        let preview = state
            .artifact(phase)
            .map(|a| truncate_chars(a, ARTIFACT_PREVIEW_CHARS))
            .unwrap_or_default();
        Self::Artifact { phase, preview }
    }
}

/// Structured payload returned when a run suspends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptPayload {
    pub node: Phase,
    pub message: String,
    pub context: GateContext,
    pub run_id: String,
    pub feature_id: String,
}

/// Suspend request raised from inside a node body.
///
/// This is control flow, not a failure: the auto-fix wrapper never
/// classifies or retries it, and the engine turns it into a suspension.
#[derive(Debug, Clone, thiserror::Error)]
#[error("interrupt requested by {phase}: {message}")]
pub struct Interrupt {
    pub phase: Phase,
    pub message: String,
    pub context: GateContext,
}

/// Whether an error chain carries a suspend request.
pub fn as_interrupt(err: &anyhow::Error) -> Option<&Interrupt> {
    err.chain().find_map(|e| e.downcast_ref::<Interrupt>())
}

/// Decides whether a phase boundary suspends and builds the payload.
pub struct ApprovalGate;

impl ApprovalGate {
    /// Whether the boundary after `phase` needs a human decision for this run.
    pub fn requires_approval(phase: Phase, gates: &ApprovalGates) -> bool {
        GateKind::for_phase(phase).is_some_and(|kind| !gates.allows(kind))
    }

    pub fn payload(run_id: &str, phase: Phase, state: &RunState, context: GateContext) -> InterruptPayload {
        InterruptPayload {
            node: phase,
            message: Self::prompt_message(phase, state),
            context,
            run_id: run_id.to_string(),
            feature_id: state.feature_id.clone(),
        }
    }

    fn prompt_message(phase: Phase, state: &RunState) -> String {
        match phase {
            Phase::Requirements => "Review the requirements document and approve or reject with feedback.".to_string(),
            Phase::Plan => "Review the implementation plan and approve or reject with feedback.".to_string(),
            Phase::Merge => match state.pr_url.as_deref() {
                Some(url) => format!("Ready to merge {}. Approve to merge or reject with feedback.", url),
                None => "Ready to merge the feature branch. Approve to merge or reject with feedback.".to_string(),
            },
            other => format!("Review the {} output and approve or reject with feedback.", other.title().to_lowercase()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_mapping_covers_prd_plan_merge_only() {
        assert_eq!(GateKind::for_phase(Phase::Requirements), Some(GateKind::Prd));
        assert_eq!(GateKind::for_phase(Phase::Plan), Some(GateKind::Plan));
        assert_eq!(GateKind::for_phase(Phase::Merge), Some(GateKind::Merge));
        assert_eq!(GateKind::for_phase(Phase::Analyze), None);
        assert_eq!(GateKind::for_phase(Phase::Implement), None);
    }

    #[test]
    fn requires_approval_only_when_flag_is_false() {
        let manual = ApprovalGates::all_manual();
        assert!(ApprovalGate::requires_approval(Phase::Requirements, &manual));
        assert!(!ApprovalGate::requires_approval(Phase::Research, &manual));
        let auto = ApprovalGates::autonomous();
        assert!(!ApprovalGate::requires_approval(Phase::Merge, &auto));
    }

    #[test]
    fn resume_command_is_tagged_union() {
        let json = serde_json::to_string(&ResumeCommand::reject("add tests")).unwrap();
        assert_eq!(json, r#"{"action":"rejected","feedback":"add tests"}"#);
        let back: ResumeCommand = serde_json::from_str(r#"{"action":"approved"}"#).unwrap();
        assert_eq!(back, ResumeCommand::Approved);
    }

    #[test]
    fn interrupt_is_found_through_context_layers() {
        let err = anyhow::Error::new(Interrupt {
            phase: Phase::Plan,
            message: "need input".into(),
            context: GateContext::Artifact {
                phase: Phase::Plan,
                preview: String::new(),
            },
        })
        .context("while planning");
        assert_eq!(as_interrupt(&err).map(|i| i.phase), Some(Phase::Plan));
        assert!(as_interrupt(&anyhow::anyhow!("plain")).is_none());
    }

    #[test]
    fn merge_payload_mentions_pr_url() {
        let mut state = RunState::new("f", "/r", "/w", "/s");
        state.pr_url = Some("https://github.com/o/r/pull/9".into());
        let payload = ApprovalGate::payload(
            "run-1",
            Phase::Merge,
            &state,
            GateContext::Merge {
                diff: None,
                pr_url: state.pr_url.clone(),
                pr_number: Some(9),
                ci_status: Some(CiStatus::Success),
                commit_hash: None,
            },
        );
        assert!(payload.message.contains("pull/9"));
        assert_eq!(payload.run_id, "run-1");
        assert_eq!(payload.feature_id, "f");
    }
}
