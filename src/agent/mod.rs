//! Coding-agent invocation.
//!
//! Every phase delegates its real work to an [`AgentExecutor`]. The engine
//! only cares about the structural contract: a prompt and options go in,
//! result text and an exit code come out.

mod claude;

pub use claude::{ClaudeCliExecutor, parse_stream_output};

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reply prefix an agent uses to decline a fix request.
pub const UNFIXABLE_SENTINEL: &str = "UNFIXABLE:";

/// Options for a single agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOptions {
    /// Working directory for the agent process.
    pub cwd: PathBuf,
    /// Short label identifying the call site (e.g. `plan`, `fix:plan`, `ci-fix`).
    pub label: String,
    pub timeout: Option<Duration>,
}

impl AgentOptions {
    pub fn new(cwd: impl AsRef<Path>, label: impl Into<String>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
            label: label.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Output of one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    pub result: String,
    pub exit_code: i32,
}

impl AgentOutput {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            exit_code: 0,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The reason text if the agent replied with the unfixable sentinel.
    pub fn unfixable_reason(&self) -> Option<&str> {
        self.result
            .trim_start()
            .strip_prefix(UNFIXABLE_SENTINEL)
            .map(str::trim)
    }
}

/// Invokes the underlying coding agent.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run the agent with `prompt`. Process-level failures are errors;
    /// a non-zero exit code is reported in the output.
    async fn execute(&self, prompt: &str, options: &AgentOptions) -> Result<AgentOutput>;

    fn supports_feature(&self, name: &str) -> bool;
}
