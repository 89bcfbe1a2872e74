//! Bridge backend wrapping the `claude` CLI.
//!
//! Spawns `claude -p <prompt> --output-format stream-json` and decodes each
//! stdout line into an [`SdkMessage`]. Process-level failures surface as
//! `StreamError` items inside the stream, never as panics.

use super::message::{SdkMessage, StreamErrorKind};
use super::{BridgeError, MessageStream, QueryRequest, SdkBridge};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Executes queries by spawning the `claude` CLI.
pub struct ClaudeCliBridge {
    /// Path to the executable. `None` searches PATH.
    claude_path: Option<PathBuf>,
    /// Model identifier forwarded as `--model`.
    model: Option<String>,
    /// Extra CLI arguments appended verbatim.
    extra_args: Vec<String>,
}

impl ClaudeCliBridge {
    pub fn new() -> Self {
        Self {
            claude_path: None,
            model: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.claude_path = Some(path.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    fn command_name(&self) -> String {
        self.claude_path
            .as_deref()
            .map(Path::to_string_lossy)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "claude".to_string())
    }

    fn build_command(&self, request: &QueryRequest) -> Command {
        let mut cmd = Command::new(self.command_name());
        cmd.arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");

        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(system) = &request.system_prompt {
            cmd.arg("--append-system-prompt").arg(system);
        }
        if let Some(session) = &request.session_id {
            cmd.arg("--resume").arg(session);
        }
        if !request.allowed_tools.is_empty() {
            cmd.arg("--allowedTools")
                .arg(request.allowed_tools.join(","));
        }
        if let Some(mode) = &request.permission_mode {
            cmd.arg("--permission-mode").arg(mode.as_flag());
        }
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        for arg in &self.extra_args {
            cmd.arg(arg);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for ClaudeCliBridge {
    fn default() -> Self {
        Self::new()
    }
}

struct StreamState {
    lines: Lines<BufReader<ChildStdout>>,
    child: Child,
    cancellation: CancellationToken,
    saw_result: bool,
    finished: bool,
}

impl StreamState {
    async fn next_message(&mut self) -> Option<SdkMessage> {
        if self.finished {
            return None;
        }
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => {
                    self.finished = true;
                    let _ = self.child.start_kill();
                    return Some(SdkMessage::StreamError {
                        kind: StreamErrorKind::Cancelled,
                        message: "stream cancelled".to_string(),
                    });
                }
                line = self.lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let Some(msg) = SdkMessage::from_stream_line(&line) else {
                            continue;
                        };
                        if matches!(msg, SdkMessage::Result { .. }) {
                            self.saw_result = true;
                        }
                        return Some(msg);
                    }
                    Ok(None) => {
                        self.finished = true;
                        return self.finish().await;
                    }
                    Err(e) => {
                        self.finished = true;
                        let _ = self.child.start_kill();
                        return Some(SdkMessage::StreamError {
                            kind: StreamErrorKind::ConnectionLost,
                            message: format!("stream read failed: {e}"),
                        });
                    }
                }
            }
        }
    }

    /// Stdout is drained; classify how the process ended.
    async fn finish(&mut self) -> Option<SdkMessage> {
        let mut stderr = String::new();
        if let Some(mut pipe) = self.child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(e) => {
                return Some(SdkMessage::StreamError {
                    kind: StreamErrorKind::ConnectionLost,
                    message: format!("failed to reap backend process: {e}"),
                });
            }
        };
        if status.success() || self.saw_result {
            return None;
        }
        error!(
            target: "agent_harness::bridge",
            "claude exited with {status}: {stderr}"
        );
        Some(SdkMessage::StreamError {
            kind: classify_failure(&stderr),
            message: format!("claude exited with {status}: {}", stderr.trim()),
        })
    }
}

/// Maps backend stderr onto a stream error kind. The CLI has no structured
/// error channel, so this is a substring scan.
fn classify_failure(stderr: &str) -> StreamErrorKind {
    let lower = stderr.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") {
        StreamErrorKind::RateLimited {
            retry_after_secs: None,
        }
    } else if lower.contains("session") && (lower.contains("expired") || lower.contains("not found"))
    {
        StreamErrorKind::SessionExpired
    } else {
        StreamErrorKind::ConnectionLost
    }
}

#[async_trait]
impl SdkBridge for ClaudeCliBridge {
    async fn query(&self, request: QueryRequest) -> Result<MessageStream, BridgeError> {
        let mut cmd = self.build_command(&request);
        debug!(
            target: "agent_harness::bridge",
            "spawning claude, prompt length {}", request.prompt.len()
        );

        let mut child = cmd.spawn().map_err(BridgeError::Spawn)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Unavailable("child stdout not captured".to_string()))?;

        let state = StreamState {
            lines: BufReader::new(stdout).lines(),
            child,
            cancellation: request.cancellation.clone(),
            saw_result: false,
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            state.next_message().await.map(|msg| (msg, state))
        });
        Ok(Box::pin(stream))
    }

    async fn is_available(&self) -> Result<(), BridgeError> {
        #[cfg(unix)]
        let check_cmd = "which";
        #[cfg(windows)]
        let check_cmd = "where";

        let output = Command::new(check_cmd)
            .arg(self.command_name())
            .output()
            .await
            .map_err(BridgeError::Spawn)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(BridgeError::Unavailable(format!(
                "{} not found in PATH",
                self.command_name()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(
            classify_failure("Error: 429 rate limit exceeded"),
            StreamErrorKind::RateLimited {
                retry_after_secs: None
            }
        );
    }

    #[test]
    fn test_classify_session_expiry() {
        assert_eq!(
            classify_failure("error: session abc123 expired"),
            StreamErrorKind::SessionExpired
        );
        assert_eq!(
            classify_failure("error: session not found"),
            StreamErrorKind::SessionExpired
        );
    }

    #[test]
    fn test_classify_default_is_connection_loss() {
        assert_eq!(
            classify_failure("segmentation fault"),
            StreamErrorKind::ConnectionLost
        );
    }

    #[test]
    fn test_builder_configures_path_and_model() {
        let bridge = ClaudeCliBridge::new()
            .with_path("/usr/local/bin/claude")
            .with_model("sonnet")
            .with_arg("--verbose");
        assert_eq!(bridge.command_name(), "/usr/local/bin/claude");
        assert_eq!(bridge.model.as_deref(), Some("sonnet"));
        assert_eq!(bridge.extra_args, vec!["--verbose".to_string()]);
    }
}
