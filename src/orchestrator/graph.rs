//! The phase graph: nodes plus routing between them.

use super::nodes::{AgentPhaseNode, PhaseNode};
use super::state::RunState;
use crate::agent::AgentExecutor;
use crate::ledger::RejectionFeedbackLog;
use crate::phase::Phase;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Where a run stands between engine steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "at", content = "phase", rename_all = "snake_case")]
pub enum GraphPosition {
    /// About to run the phase's primary work.
    Node(Phase),
    /// Primary work done; suspended until a resume decision arrives.
    AwaitingApproval(Phase),
    /// The node asked a question before finishing its primary work; an
    /// answer of either kind re-enters the node.
    Interrupted(Phase),
    /// Post-approval half of a phase.
    Finalize(Phase),
    Done,
}

impl GraphPosition {
    /// Whether the run is parked here until `invoke` gets a resume command.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::AwaitingApproval(_) | Self::Interrupted(_))
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Node(p) | Self::AwaitingApproval(p) | Self::Interrupted(p) | Self::Finalize(p) => Some(*p),
            Self::Done => None,
        }
    }
}

impl fmt::Display for GraphPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(p) => write!(f, "node:{}", p),
            Self::AwaitingApproval(p) => write!(f, "awaiting_approval:{}", p),
            Self::Interrupted(p) => write!(f, "interrupted:{}", p),
            Self::Finalize(p) => write!(f, "finalize:{}", p),
            Self::Done => write!(f, "done"),
        }
    }
}

/// `analyze → requirements → research → plan → implement → merge → done`.
#[derive(Clone, Default)]
pub struct PhaseGraph {
    nodes: BTreeMap<Phase, Arc<dyn PhaseNode>>,
}

impl PhaseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the node for its phase.
    pub fn with_node(mut self, node: Arc<dyn PhaseNode>) -> Self {
        self.nodes.insert(node.phase(), node);
        self
    }

    /// Agent-driven nodes for every phase up to implement, plus `merge`.
    pub fn standard(
        agent: Arc<dyn AgentExecutor>,
        feedback: RejectionFeedbackLog,
        merge: Arc<dyn PhaseNode>,
    ) -> Self {
        let mut graph = Self::new();
        for phase in [
            Phase::Analyze,
            Phase::Requirements,
            Phase::Research,
            Phase::Plan,
            Phase::Implement,
        ] {
            graph = graph.with_node(Arc::new(AgentPhaseNode::new(
                phase,
                agent.clone(),
                feedback.clone(),
            )));
        }
        graph.with_node(merge)
    }

    pub fn entry(&self) -> GraphPosition {
        GraphPosition::Node(Phase::Analyze)
    }

    pub fn node(&self, phase: Phase) -> Result<&Arc<dyn PhaseNode>> {
        self.nodes
            .get(&phase)
            .ok_or_else(|| anyhow!("No node registered for phase {}", phase))
    }

    /// Routing after `phase` has fully finished.
    pub fn next(&self, phase: Phase, state: &RunState) -> GraphPosition {
        match phase {
            Phase::Implement if state.produces_merge() => GraphPosition::Node(Phase::Merge),
            Phase::Implement | Phase::Merge => GraphPosition::Done,
            other => other
                .successor()
                .map(GraphPosition::Node)
                .unwrap_or(GraphPosition::Done),
        }
    }

    /// Routing once the gate after `phase` has been passed.
    pub fn after_gate(&self, phase: Phase, state: &RunState) -> GraphPosition {
        match self.nodes.get(&phase) {
            Some(node) if node.has_finalize() => GraphPosition::Finalize(phase),
            _ => self.next(phase, state),
        }
    }
}
