//! Iteration executor: exactly one LLM round-trip.
//!
//! Opens a streamed query through the SDK bridge, consumes messages in
//! arrival order into an [`IterationSummary`], and fixes the session id
//! from the terminal result message. The executor never returns an error
//! and never retries: transport failures are captured inside the summary,
//! and retry policy belongs to the runner.

use crate::bridge::message::SdkMessage;
use crate::bridge::{QueryRequest, SdkBridge, StreamErrorKind};
use crate::definition::PermissionMode;
use crate::extract;
use crate::logging::JsonlLogger;
use crate::summary::{IterationError, IterationSummary};
use futures::StreamExt;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Inputs for one round-trip.
#[derive(Debug, Clone)]
pub struct IterationRequest {
    pub iteration: u32,
    pub step_id: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub session_id: Option<String>,
}

/// A finished round-trip: the summary plus the session id to carry forward.
#[derive(Debug)]
pub struct IterationOutcome {
    pub summary: IterationSummary,
    pub session_id: Option<String>,
}

/// Executes round-trips against one bridge.
pub struct IterationExecutor {
    bridge: Arc<dyn SdkBridge>,
    allowed_tools: Vec<String>,
    permission_mode: Option<PermissionMode>,
    cwd: Option<PathBuf>,
    cancellation: CancellationToken,
    logger: Arc<JsonlLogger>,
}

impl IterationExecutor {
    pub fn new(
        bridge: Arc<dyn SdkBridge>,
        allowed_tools: Vec<String>,
        permission_mode: Option<PermissionMode>,
        cwd: Option<PathBuf>,
        cancellation: CancellationToken,
        logger: Arc<JsonlLogger>,
    ) -> Self {
        Self {
            bridge,
            allowed_tools,
            permission_mode,
            cwd,
            cancellation,
            logger,
        }
    }

    /// Runs one round-trip. Messages are processed in stream order; the
    /// terminal result message fixes the session id, and absent one the
    /// caller's id is kept.
    pub async fn execute(&self, request: IterationRequest) -> IterationOutcome {
        let mut summary = IterationSummary::new(request.iteration, request.step_id.clone());
        summary.session_id = request.session_id.clone();
        let mut session_id = request.session_id.clone();

        self.logger.log(
            crate::logging::LogLevel::User,
            &request.prompt,
            json!({"iteration": request.iteration, "step": request.step_id}),
        );

        let query = QueryRequest {
            prompt: request.prompt,
            system_prompt: request.system_prompt,
            session_id: request.session_id,
            allowed_tools: self.allowed_tools.clone(),
            permission_mode: self.permission_mode,
            cwd: self.cwd.clone(),
            cancellation: self.cancellation.clone(),
        };

        let mut stream = match self.bridge.query(query).await {
            Ok(stream) => stream,
            Err(e) => {
                summary
                    .errors
                    .push(IterationError::stream(StreamErrorKind::ConnectionLost, e.to_string()));
                return IterationOutcome {
                    summary,
                    session_id,
                };
            }
        };

        while let Some(message) = stream.next().await {
            match message {
                SdkMessage::AssistantText { text } => {
                    self.logger.assistant(&text, json!({"iteration": request.iteration}));
                    summary.responses.push(text);
                }
                SdkMessage::ToolUse { name, input } => {
                    self.logger.tool(
                        &name,
                        json!({"iteration": request.iteration, "input": input}),
                    );
                    summary.tools_used.insert(name);
                }
                SdkMessage::ToolResult {
                    tool,
                    is_error,
                    content,
                } => {
                    self.logger.tool(
                        format!("{tool} result"),
                        json!({"is_error": is_error, "content": content}),
                    );
                }
                SdkMessage::Result {
                    session_id: sid,
                    usage,
                    is_error,
                } => {
                    self.logger.result(
                        "iteration result",
                        json!({"session_id": sid, "is_error": is_error}),
                    );
                    if let Some(sid) = sid {
                        session_id = Some(sid);
                    }
                    summary.usage = usage;
                }
                SdkMessage::System { subtype, raw } => {
                    // Ignored for control flow, retained in the log.
                    self.logger
                        .log(crate::logging::LogLevel::System, subtype, raw);
                }
                SdkMessage::StreamError { kind, message } => {
                    self.logger
                        .error(&message, json!({"kind": format!("{kind:?}")}));
                    summary.errors.push(IterationError::stream(kind, message));
                }
            }
        }

        // The last decodable JSON object across the responses wins.
        for response in &summary.responses {
            if let Some(value) = extract::extract_structured_output(response) {
                summary.structured_output = Some(value);
            }
        }

        summary.session_id = session_id.clone();
        debug!(
            target: "agent_harness::executor",
            "iteration {} consumed {} response(s), {} error(s)",
            summary.iteration,
            summary.responses.len(),
            summary.errors.len()
        );
        IterationOutcome {
            summary,
            session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::scripted::{assistant_structured, assistant_text, result_ok};
    use crate::bridge::ScriptedBridge;
    use serde_json::json;

    fn executor(bridge: ScriptedBridge) -> IterationExecutor {
        IterationExecutor::new(
            Arc::new(bridge),
            vec!["Bash".to_string()],
            None,
            None,
            CancellationToken::new(),
            Arc::new(JsonlLogger::disabled()),
        )
    }

    fn request(iteration: u32, session: Option<&str>) -> IterationRequest {
        IterationRequest {
            iteration,
            step_id: "initial.issue".to_string(),
            prompt: "do the work".to_string(),
            system_prompt: None,
            session_id: session.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_terminal_result_fixes_the_session_id() {
        let bridge = ScriptedBridge::new().with_turn(vec![
            assistant_text("working"),
            result_ok("sess-new"),
        ]);
        let outcome = executor(bridge).execute(request(1, Some("sess-old"))).await;
        assert_eq!(outcome.session_id.as_deref(), Some("sess-new"));
        assert_eq!(outcome.summary.session_id.as_deref(), Some("sess-new"));
    }

    #[tokio::test]
    async fn test_missing_terminal_result_keeps_the_callers_session() {
        let bridge = ScriptedBridge::new().with_turn(vec![assistant_text("no result follows")]);
        let outcome = executor(bridge).execute(request(1, Some("sess-old"))).await;
        assert_eq!(outcome.session_id.as_deref(), Some("sess-old"));
    }

    #[tokio::test]
    async fn test_messages_accumulate_in_stream_order() {
        let bridge = ScriptedBridge::new().with_turn(vec![
            assistant_text("first"),
            SdkMessage::ToolUse {
                name: "Bash".to_string(),
                input: Some(json!({"command": "cargo test"})),
            },
            assistant_text("second"),
            result_ok("s"),
        ]);
        let outcome = executor(bridge).execute(request(1, None)).await;
        assert_eq!(outcome.summary.responses, vec!["first", "second"]);
        assert!(outcome.summary.tools_used.contains("Bash"));
        assert_eq!(outcome.summary.usage.as_ref().unwrap().turns, Some(1));
    }

    #[tokio::test]
    async fn test_stream_errors_are_captured_not_thrown() {
        let bridge = ScriptedBridge::new().with_turn(vec![
            assistant_text("partial"),
            SdkMessage::StreamError {
                kind: StreamErrorKind::RateLimited {
                    retry_after_secs: Some(5),
                },
                message: "slow down".to_string(),
            },
        ]);
        let outcome = executor(bridge).execute(request(2, None)).await;
        assert_eq!(outcome.summary.errors.len(), 1);
        assert!(matches!(
            outcome.summary.errors[0].kind,
            crate::summary::IterationErrorKind::Stream(StreamErrorKind::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_structured_output_is_the_last_json_block() {
        let bridge = ScriptedBridge::new().with_turn(vec![
            assistant_structured(&json!({"status": "working"})),
            assistant_structured(&json!({"status": "completed"})),
            result_ok("s"),
        ]);
        let outcome = executor(bridge).execute(request(1, None)).await;
        assert_eq!(
            outcome.summary.structured_output,
            Some(json!({"status": "completed"}))
        );
    }
}
