//! Configuration for the flow engine, read from `.forge/flow.toml`.
//!
//! Layering follows file → environment → explicit overrides. Every field has a
//! serde default so a missing file or a partial file both load cleanly.
//!
//! ```toml
//! [agent]
//! claude_cmd = "claude"
//! skip_permissions = true
//! timeout_secs = 1800
//!
//! [autofix]
//! enabled = true
//! max_attempts = 2
//!
//! [ci]
//! max_fix_attempts = 3
//! watch_timeout_secs = 600
//! poll_interval_secs = 10
//! repoll_attempts = 6
//! failure_log_max_chars = 10000
//!
//! [approval]
//! max_rejections = 5
//!
//! [watchers]
//! interval_ms = 3000
//!
//! [logging]
//! json = false
//! directory = ".forge/logs"
//! filter = "forge_flow=debug"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Coding agent invocation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_claude_cmd")]
    pub claude_cmd: String,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    /// Per-invocation wall clock limit; unset means no limit.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_claude_cmd() -> String {
    "claude".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            claude_cmd: default_claude_cmd(),
            skip_permissions: true,
            timeout_secs: None,
        }
    }
}

/// Node auto-fix settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoFixConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_autofix_attempts")]
    pub max_attempts: u32,
}

fn default_autofix_attempts() -> u32 {
    2
}

impl Default for AutoFixConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_autofix_attempts(),
        }
    }
}

/// CI watch/fix loop settings used by the merge phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiConfig {
    #[serde(default = "default_ci_fix_attempts")]
    pub max_fix_attempts: u32,
    #[serde(default = "default_watch_timeout_secs")]
    pub watch_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// How many times to poll for a fresh run after a fix push.
    #[serde(default = "default_repoll_attempts")]
    pub repoll_attempts: u32,
    #[serde(default = "default_failure_log_max_chars")]
    pub failure_log_max_chars: usize,
}

fn default_ci_fix_attempts() -> u32 {
    3
}

fn default_watch_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_repoll_attempts() -> u32 {
    6
}

fn default_failure_log_max_chars() -> usize {
    10_000
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            max_fix_attempts: default_ci_fix_attempts(),
            watch_timeout_secs: default_watch_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            repoll_attempts: default_repoll_attempts(),
            failure_log_max_chars: default_failure_log_max_chars(),
        }
    }
}

impl CiConfig {
    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Rejections allowed per phase before the engine refuses further ones.
    #[serde(default)]
    pub max_rejections: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    3_000
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

impl WatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Directory for a daily-rolling log file, in addition to stderr.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default)]
    pub filter: Option<String>,
}

/// Top-level `flow.toml` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub autofix: AutoFixConfig,
    #[serde(default)]
    pub ci: CiConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub watchers: WatcherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FlowConfig {
    pub const FILE_NAME: &'static str = "flow.toml";

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse flow.toml")
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Load `<project>/.forge/flow.toml` (defaults when absent), apply
    /// environment overrides and validate.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(".forge").join(Self::FILE_NAME);
        let mut config = if path.exists() {
            Self::load_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());

        let problems = config.validate();
        if !problems.is_empty() {
            anyhow::bail!("Invalid configuration in {}: {}", path.display(), problems.join("; "));
        }
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cmd) = lookup("CLAUDE_CMD")
            && !cmd.trim().is_empty()
        {
            self.agent.claude_cmd = cmd;
        }
        if let Some(value) = lookup("SKIP_PERMISSIONS") {
            self.agent.skip_permissions = value != "false";
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize flow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Problems that make the configuration unusable. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.agent.claude_cmd.trim().is_empty() {
            problems.push("agent.claude_cmd must not be empty".to_string());
        }
        if self.agent.timeout_secs == Some(0) {
            problems.push("agent.timeout_secs must be greater than 0".to_string());
        }
        if self.autofix.max_attempts == 0 {
            problems.push("autofix.max_attempts must be at least 1".to_string());
        }
        if self.ci.max_fix_attempts == 0 {
            problems.push("ci.max_fix_attempts must be at least 1".to_string());
        }
        if self.ci.watch_timeout_secs == 0 {
            problems.push("ci.watch_timeout_secs must be greater than 0".to_string());
        }
        if self.ci.repoll_attempts == 0 {
            problems.push("ci.repoll_attempts must be at least 1".to_string());
        }
        if self.approval.max_rejections == Some(0) {
            problems.push("approval.max_rejections must be at least 1 when set".to_string());
        }
        if self.watchers.interval_ms == 0 {
            problems.push("watchers.interval_ms must be greater than 0".to_string());
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = FlowConfig::default();
        assert_eq!(config.agent.claude_cmd, "claude");
        assert!(config.agent.skip_permissions);
        assert!(config.autofix.enabled);
        assert_eq!(config.autofix.max_attempts, 2);
        assert_eq!(config.ci.max_fix_attempts, 3);
        assert_eq!(config.ci.failure_log_max_chars, 10_000);
        assert_eq!(config.approval.max_rejections, None);
        assert_eq!(config.watchers.interval(), Duration::from_millis(3_000));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = FlowConfig::parse(
            r#"
            [ci]
            max_fix_attempts = 5

            [approval]
            max_rejections = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.ci.max_fix_attempts, 5);
        assert_eq!(config.ci.watch_timeout_secs, 600);
        assert_eq!(config.approval.max_rejections, Some(3));
        assert_eq!(config.autofix.max_attempts, 2);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = FlowConfig::parse("[agent]\nclaude_cmd = \"from-file\"\n").unwrap();
        let env: HashMap<&str, &str> = [("CLAUDE_CMD", "from-env"), ("SKIP_PERMISSIONS", "false")]
            .into_iter()
            .collect();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.agent.claude_cmd, "from-env");
        assert!(!config.agent.skip_permissions);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = FlowConfig::default();
        config.autofix.max_attempts = 0;
        config.watchers.interval_ms = 0;
        let problems = config.validate();
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.contains("autofix.max_attempts")));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = FlowConfig::load(dir.path()).unwrap();
        assert_eq!(config.ci.max_fix_attempts, 3);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".forge")).unwrap();
        std::fs::write(
            dir.path().join(".forge").join(FlowConfig::FILE_NAME),
            "[ci]\nmax_fix_attempts = 0\n",
        )
        .unwrap();
        let err = FlowConfig::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("ci.max_fix_attempts"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flow.toml");
        let mut config = FlowConfig::default();
        config.approval.max_rejections = Some(4);
        config.save(&path).unwrap();
        assert_eq!(FlowConfig::load_file(&path).unwrap(), config);
    }
}
