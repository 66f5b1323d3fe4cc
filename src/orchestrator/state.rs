//! Run state threaded through every phase of one feature's execution.
//!
//! Every field declares its merge policy in the schema below. Nodes never
//! mutate `RunState` directly; they return a `StateUpdate` which the engine
//! applies uniformly:
//!
//! - `Replace` fields: `Some(v)` in the update overwrites the current value.
//! - `Append` fields: items in the update are appended, never cleared.

use crate::gates::{ApprovalAction, ApprovalGates};
use crate::git::CiStatus;
use crate::phase::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How a field of `RunState` combines with a partial update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    Replace,
    Append,
}

macro_rules! run_state_schema {
    (
        $(#[$meta:meta])*
        pub struct RunState {
            replace {
                $( $(#[$rdoc:meta])* $rname:ident : $rty:ty ),* $(,)?
            }
            append {
                $( $(#[$adoc:meta])* $aname:ident : Vec<$aty:ty> ),* $(,)?
            }
        }
    ) => {
        $(#[$meta])*
        pub struct RunState {
            $( $(#[$rdoc])* pub $rname: $rty, )*
            $( $(#[$adoc])* pub $aname: Vec<$aty>, )*
        }

        /// Partial update returned by a node and merged into `RunState`.
        ///
        /// Builder methods share the field names: replace fields take the new
        /// value, append fields take one item to push.
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct StateUpdate {
            $( pub $rname: Option<$rty>, )*
            $( pub $aname: Vec<$aty>, )*
        }

        impl StateUpdate {
            $(
                pub fn $rname(mut self, value: $rty) -> Self {
                    self.$rname = Some(value);
                    self
                }
            )*
            $(
                pub fn $aname(mut self, item: $aty) -> Self {
                    self.$aname.push(item);
                    self
                }
            )*

            pub fn is_empty(&self) -> bool {
                $( self.$rname.is_none() && )*
                $( self.$aname.is_empty() && )*
                true
            }

            /// Fold a later update into this one using the same field policies.
            pub fn merge(&mut self, later: StateUpdate) {
                $(
                    if later.$rname.is_some() {
                        self.$rname = later.$rname;
                    }
                )*
                $( self.$aname.extend(later.$aname); )*
            }
        }

        impl RunState {
            /// Merge policy of every field, in declaration order.
            pub const FIELD_POLICIES: &'static [(&'static str, MergePolicy)] = &[
                $( (stringify!($rname), MergePolicy::Replace), )*
                $( (stringify!($aname), MergePolicy::Append), )*
            ];

            /// Apply a partial update according to each field's policy.
            pub fn apply(&mut self, update: StateUpdate) {
                $(
                    if let Some(value) = update.$rname {
                        self.$rname = value;
                    }
                )*
                $( self.$aname.extend(update.$aname); )*
            }
        }
    };
}

run_state_schema! {
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct RunState {
        replace {
            feature_id: String,
            repository_path: PathBuf,
            /// Exclusive working copy of the feature branch.
            worktree_path: PathBuf,
            /// Directory holding the feature's spec document (ledger + feedback).
            spec_dir: PathBuf,
            description: String,
            branch: Option<String>,
            approval_gates: ApprovalGates,
            push: bool,
            open_pr: bool,
            merge_enabled: bool,

            analysis: Option<String>,
            requirements: Option<String>,
            research: Option<String>,
            plan: Option<String>,
            implementation: Option<String>,

            commit_hash: Option<String>,
            pr_url: Option<String>,
            pr_number: Option<u64>,
            ci_status: Option<CiStatus>,

            ci_fix_attempts: u32,
            ci_fix_status: FixStatus,
            /// Attempt count of the most recently wrapped node.
            node_fix_attempts: u32,
            node_fix_status: FixStatus,

            /// Mirror of the phase ledger, written together with it.
            completed_phases: Vec<Phase>,

            approval_action: Option<ApprovalAction>,
            rejection_feedback: Option<String>,
            needs_reexecution: bool,
            current_node: Option<Phase>,
        }
        append {
            messages: Vec<String>,
            ci_fix_history: Vec<FixAttemptRecord>,
            /// Accumulates across the whole run, regardless of which node produced it.
            node_fix_history: Vec<FixAttemptRecord>,
        }
    }
}

impl RunState {
    pub fn new(
        feature_id: impl Into<String>,
        repository_path: impl Into<PathBuf>,
        worktree_path: impl Into<PathBuf>,
        spec_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            feature_id: feature_id.into(),
            repository_path: repository_path.into(),
            worktree_path: worktree_path.into(),
            spec_dir: spec_dir.into(),
            merge_enabled: true,
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_gates(mut self, gates: ApprovalGates) -> Self {
        self.approval_gates = gates;
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Configure what the merge phase delivers.
    pub fn with_delivery(mut self, push: bool, open_pr: bool, merge_enabled: bool) -> Self {
        self.push = push;
        self.open_pr = open_pr;
        self.merge_enabled = merge_enabled;
        self
    }

    /// Whether the feature is configured to produce a merge phase at all.
    pub fn produces_merge(&self) -> bool {
        self.push || self.open_pr || self.merge_enabled
    }

    /// The artifact a phase produced, if any.
    pub fn artifact(&self, phase: Phase) -> Option<&str> {
        match phase {
            Phase::Analyze => self.analysis.as_deref(),
            Phase::Requirements => self.requirements.as_deref(),
            Phase::Research => self.research.as_deref(),
            Phase::Plan => self.plan.as_deref(),
            Phase::Implement => self.implementation.as_deref(),
            Phase::Merge => self.pr_url.as_deref().or(self.commit_hash.as_deref()),
        }
    }

    /// Whether a rejection is waiting to be re-executed by `phase`.
    pub fn pending_rejection_for(&self, phase: Phase) -> bool {
        self.needs_reexecution && self.current_node == Some(phase)
    }
}

impl StateUpdate {
    /// Store a phase's primary artifact in the matching field.
    pub fn artifact(self, phase: Phase, content: String) -> Self {
        match phase {
            Phase::Analyze => self.analysis(Some(content)),
            Phase::Requirements => self.requirements(Some(content)),
            Phase::Research => self.research(Some(content)),
            Phase::Plan => self.plan(Some(content)),
            Phase::Implement => self.implementation(Some(content)),
            Phase::Merge => self,
        }
    }

    /// Reset the transient approval control fields.
    pub fn cleared_controls() -> Self {
        StateUpdate::default()
            .approval_action(None)
            .rejection_feedback(None)
            .needs_reexecution(false)
    }
}

/// Status of a fix loop (node auto-fix or CI fix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    #[default]
    Idle,
    Success,
    Exhausted,
    Timeout,
}

impl fmt::Display for FixStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Success => write!(f, "success"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Outcome of a single fix attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixOutcome {
    Fixed,
    Failed,
    Timeout,
}

impl fmt::Display for FixOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Maximum characters of error / failure text kept on a fix record.
pub const FIX_SUMMARY_MAX_CHARS: usize = 500;

/// One automatic self-repair cycle after a node or CI failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixAttemptRecord {
    pub attempt: u32,
    /// Node name, or the CI-fix label.
    pub name: String,
    pub started_at: DateTime<Utc>,
    /// Truncated error (node fixes) or failure (CI fixes) summary.
    pub summary: String,
    pub outcome: FixOutcome,
}

impl FixAttemptRecord {
    pub fn new(attempt: u32, name: impl Into<String>, started_at: DateTime<Utc>, summary: &str, outcome: FixOutcome) -> Self {
        Self {
            attempt,
            name: name.into(),
            started_at,
            summary: truncate_chars(summary, FIX_SUMMARY_MAX_CHARS),
            outcome,
        }
    }
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
