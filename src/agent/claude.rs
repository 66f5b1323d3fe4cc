use super::{AgentExecutor, AgentOptions, AgentOutput};
use crate::config::AgentConfig;
use crate::errors::AgentError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Events from the Claude CLI's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Fold stream-json lines into the final result text.
///
/// The `result` event wins when present; otherwise assistant text blocks and
/// non-JSON lines are concatenated. Returns the text and whether the CLI
/// flagged the result as an error.
pub fn parse_stream_output<'a>(lines: impl IntoIterator<Item = &'a str>) -> (String, bool) {
    let mut accumulated = String::new();
    let mut final_result: Option<String> = None;
    let mut is_error = false;

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(StreamEvent::Assistant { message }) => {
                for block in message.content {
                    if let ContentBlock::Text { text } = block {
                        accumulated.push_str(&text);
                        accumulated.push('\n');
                    }
                }
            }
            Ok(StreamEvent::Result { result, is_error: err }) => {
                final_result = result;
                is_error = err;
            }
            Ok(StreamEvent::Other) => {}
            Err(_) => {
                accumulated.push_str(line);
                accumulated.push('\n');
            }
        }
    }

    (final_result.unwrap_or(accumulated), is_error)
}

/// Runs the Claude CLI as the coding agent, prompt on stdin.
pub struct ClaudeCliExecutor {
    config: AgentConfig,
}

impl ClaudeCliExecutor {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.config.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        flags
    }

    async fn run(&self, prompt: &str, options: &AgentOptions) -> Result<AgentOutput> {
        let flags = self.flags();
        let mut child = Command::new(&self.config.claude_cmd)
            .args(&flags)
            .env_remove("CLAUDECODE")
            .current_dir(&options.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::SpawnFailed {
                command: self.config.claude_cmd.clone(),
                source,
            })?;

        debug!(label = %options.label, pid = child.id().unwrap_or(0), chars = prompt.len(), "agent process spawned");

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await.map_err(AgentError::Io)?;
            stdin.shutdown().await.context("Failed to close agent stdin")?;
        }

        let stdout = child.stdout.take().context("Failed to capture agent stdout")?;
        let mut reader = BufReader::new(stdout).lines();
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await.map_err(AgentError::Io)? {
            lines.push(line);
        }

        let status = child.wait().await.map_err(AgentError::Io)?;
        let (result, is_error) = parse_stream_output(lines.iter().map(String::as_str));
        let mut exit_code = status.code().unwrap_or(-1);
        if is_error && exit_code == 0 {
            warn!(label = %options.label, "agent reported an error result with a zero exit code");
            exit_code = 1;
        }

        Ok(AgentOutput { result, exit_code })
    }
}

#[async_trait]
impl AgentExecutor for ClaudeCliExecutor {
    async fn execute(&self, prompt: &str, options: &AgentOptions) -> Result<AgentOutput> {
        let start = Instant::now();
        let timeout = options
            .timeout
            .or(self.config.timeout_secs.map(Duration::from_secs));

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(prompt, options))
                .await
                .map_err(|_| AgentError::Timeout {
                    secs: limit.as_secs(),
                })??,
            None => self.run(prompt, options).await?,
        };

        info!(
            label = %options.label,
            exit_code = output.exit_code,
            elapsed_secs = start.elapsed().as_secs_f64(),
            "agent invocation finished"
        );
        Ok(output)
    }

    fn supports_feature(&self, name: &str) -> bool {
        match name {
            "stream-json" => true,
            "skip-permissions" => self.config.skip_permissions,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_event_wins_over_assistant_text() {
        let lines = [
            r#"{"type":"system","subtype":"init"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"thinking..."}]}}"#,
            r#"{"type":"result","subtype":"success","result":"Commit: abc1234","is_error":false}"#,
        ];
        let (text, is_error) = parse_stream_output(lines);
        assert_eq!(text, "Commit: abc1234");
        assert!(!is_error);
    }

    #[test]
    fn test_accumulates_text_without_result_event() {
        let lines = [
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Edit","input":{}},{"type":"text","text":"done"}]}}"#,
            "plain stderr line",
        ];
        let (text, _) = parse_stream_output(lines);
        assert!(text.contains("done"));
        assert!(text.contains("plain stderr line"));
    }

    #[test]
    fn test_error_result_is_flagged() {
        let lines = [r#"{"type":"result","subtype":"error","result":"rate limited","is_error":true}"#];
        let (text, is_error) = parse_stream_output(lines);
        assert_eq!(text, "rate limited");
        assert!(is_error);
    }

    #[test]
    fn test_flags_respect_skip_permissions() {
        let mut config = AgentConfig::default();
        config.skip_permissions = false;
        let exec = ClaudeCliExecutor::new(config);
        assert!(!exec.flags().contains(&"--dangerously-skip-permissions".to_string()));
        assert!(exec.flags().contains(&"stream-json".to_string()));
        assert!(exec.supports_feature("stream-json"));
        assert!(!exec.supports_feature("skip-permissions"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let mut config = AgentConfig::default();
        config.claude_cmd = "definitely-not-a-real-agent-binary".to_string();
        let exec = ClaudeCliExecutor::new(config);
        let dir = tempfile::tempdir().unwrap();
        let err = exec
            .execute("hi", &AgentOptions::new(dir.path(), "test"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::SpawnFailed { .. })
        ));
    }
}
