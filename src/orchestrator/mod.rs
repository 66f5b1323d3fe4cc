//! Phase orchestration: run state, the phase graph and the engine that
//! drives a run through it.

pub mod autofix;
pub mod engine;
pub mod graph;
pub mod nodes;
pub mod prompts;
pub mod state;

pub use autofix::{ErrorClass, FixBookkeeping, NodeAutoFixWrapper, classify_error};
pub use engine::{ExecutionEngine, InvokeInput, InvokeOutcome, new_run_id};
pub use graph::{GraphPosition, PhaseGraph};
pub use nodes::{AgentPhaseNode, PhaseNode};
pub use state::{FixAttemptRecord, FixOutcome, FixStatus, RunState, StateUpdate};
