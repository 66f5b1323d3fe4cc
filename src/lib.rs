pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod gates;
pub mod git;
pub mod ledger;
pub mod logging;
pub mod merge;
pub mod notify;
pub mod orchestrator;
pub mod phase;
pub mod store;
pub mod watchers;

pub use config::FlowConfig;
pub use errors::EngineError;
pub use orchestrator::{ExecutionEngine, InvokeInput, InvokeOutcome, RunState};
pub use phase::Phase;
