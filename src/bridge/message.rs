//! Typed messages at the SDK bridge boundary.
//!
//! The bridge normalizes every downstream consumer onto one discriminated
//! union of message kinds. Anything the backing CLI emits that does not map
//! onto a kind becomes a `System` message (logged, ignored for control flow).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Usage statistics carried by the terminal `result` message, when the
/// backend provides them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turns: Option<u32>,
}

/// Failure kinds a stream can surface. The kind decides the runner's
/// transport policy: backoff, session refresh, or give up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    /// The connection or subprocess died mid-stream.
    ConnectionLost,
    /// The backend asked us to slow down; `retry_after_secs` is the
    /// server-provided delay when present.
    RateLimited { retry_after_secs: Option<u64> },
    /// The session id is no longer valid; the next iteration must start a
    /// fresh session.
    SessionExpired,
    /// The stream was cancelled from outside.
    Cancelled,
    /// A line that claimed to be a message could not be decoded.
    Protocol,
}

impl StreamErrorKind {
    /// Whether the same request is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamErrorKind::ConnectionLost | StreamErrorKind::RateLimited { .. }
        )
    }

    /// Delay before the next attempt. Rate limiting honors the server's
    /// delay when present and otherwise backs off exponentially (capped at
    /// 60s); connection loss backs off linearly. Full jitter in both cases.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = match self {
            StreamErrorKind::RateLimited {
                retry_after_secs: Some(secs),
            } => Duration::from_secs(*secs),
            StreamErrorKind::RateLimited { .. } => {
                let exp = 2_u64.pow(attempt.saturating_sub(1).min(16));
                Duration::from_secs(exp.min(60))
            }
            _ => Duration::from_millis(250 * u64::from(attempt)),
        };
        use rand::Rng;
        let cap = base.as_millis().max(1) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
    }
}

/// One message of the SDK stream, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SdkMessage {
    /// A chunk of assistant-authored text.
    AssistantText { text: String },
    /// The assistant invoked a tool, with whatever arguments it passed.
    ToolUse {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<JsonValue>,
    },
    /// A tool finished; `is_error` marks tool-level failures.
    ToolResult {
        tool: String,
        is_error: bool,
        content: String,
    },
    /// Terminal message: fixes the session id and carries usage stats.
    Result {
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        is_error: bool,
    },
    /// Backend housekeeping; logged, never routed on.
    System { subtype: String, raw: JsonValue },
    /// The stream failed. Policy belongs to the runner.
    StreamError {
        kind: StreamErrorKind,
        message: String,
    },
}

impl SdkMessage {
    /// Decodes one line of the CLI's `stream-json` output.
    ///
    /// Returns `None` for blank lines. Unknown message types map to
    /// `System`; undecodable lines map to a `Protocol` stream error so the
    /// summary records that the stream misbehaved.
    pub fn from_stream_line(line: &str) -> Option<SdkMessage> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let value: JsonValue = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                return Some(SdkMessage::StreamError {
                    kind: StreamErrorKind::Protocol,
                    message: format!("undecodable stream line: {e}"),
                });
            }
        };

        let msg_type = value.get("type").and_then(JsonValue::as_str).unwrap_or("");
        match msg_type {
            "assistant" => Some(Self::from_assistant_envelope(&value)),
            "result" => Some(SdkMessage::Result {
                session_id: value
                    .get("session_id")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
                usage: Some(Usage {
                    cost_usd: value.get("total_cost_usd").and_then(JsonValue::as_f64),
                    input_tokens: value
                        .pointer("/usage/input_tokens")
                        .and_then(JsonValue::as_u64),
                    output_tokens: value
                        .pointer("/usage/output_tokens")
                        .and_then(JsonValue::as_u64),
                    turns: value
                        .get("num_turns")
                        .and_then(JsonValue::as_u64)
                        .map(|n| n as u32),
                }),
                is_error: value
                    .get("is_error")
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(false),
            }),
            "user" => Some(Self::from_user_envelope(&value)),
            other => Some(SdkMessage::System {
                subtype: value
                    .get("subtype")
                    .and_then(JsonValue::as_str)
                    .unwrap_or(other)
                    .to_string(),
                raw: value,
            }),
        }
    }

    /// An `assistant` envelope carries a content array; text blocks and
    /// tool_use blocks are the only ones routed on. A multi-block envelope
    /// keeps only the first routable block per kind precedence (text wins),
    /// matching the one-message-per-line contract of the stream format.
    fn from_assistant_envelope(value: &JsonValue) -> SdkMessage {
        let content = value
            .pointer("/message/content")
            .and_then(JsonValue::as_array);
        if let Some(blocks) = content {
            let mut texts: Vec<&str> = Vec::new();
            for block in blocks {
                match block.get("type").and_then(JsonValue::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(JsonValue::as_str) {
                            texts.push(text);
                        }
                    }
                    Some("tool_use") => {
                        if texts.is_empty() {
                            return SdkMessage::ToolUse {
                                name: block
                                    .get("name")
                                    .and_then(JsonValue::as_str)
                                    .unwrap_or("unknown")
                                    .to_string(),
                                input: block.get("input").cloned(),
                            };
                        }
                    }
                    _ => {}
                }
            }
            if !texts.is_empty() {
                return SdkMessage::AssistantText {
                    text: texts.join("\n"),
                };
            }
        }
        SdkMessage::System {
            subtype: "assistant".to_string(),
            raw: value.clone(),
        }
    }

    /// A `user` envelope in the stream carries tool results.
    fn from_user_envelope(value: &JsonValue) -> SdkMessage {
        let block = value
            .pointer("/message/content/0")
            .cloned()
            .unwrap_or(JsonValue::Null);
        if block.get("type").and_then(JsonValue::as_str) == Some("tool_result") {
            let content = match block.get("content") {
                Some(JsonValue::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            SdkMessage::ToolResult {
                tool: block
                    .get("tool_use_id")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                is_error: block
                    .get("is_error")
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(false),
                content,
            }
        } else {
            SdkMessage::System {
                subtype: "user".to_string(),
                raw: value.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_text_line() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#;
        assert_eq!(
            SdkMessage::from_stream_line(line),
            Some(SdkMessage::AssistantText {
                text: "hello".to_string()
            })
        );
    }

    #[test]
    fn test_tool_use_line() {
        let line =
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash"}]}}"#;
        assert_eq!(
            SdkMessage::from_stream_line(line),
            Some(SdkMessage::ToolUse {
                name: "Bash".to_string(),
                input: None,
            })
        );
    }

    #[test]
    fn test_tool_use_line_keeps_the_input_arguments() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"git status"}}]}}"#;
        match SdkMessage::from_stream_line(line) {
            Some(SdkMessage::ToolUse { name, input }) => {
                assert_eq!(name, "Bash");
                assert_eq!(
                    input,
                    Some(serde_json::json!({"command": "git status"}))
                );
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_result_line_carries_session_and_usage() {
        let line = r#"{"type":"result","session_id":"sess-42","total_cost_usd":0.12,"num_turns":3,"usage":{"input_tokens":100,"output_tokens":50},"is_error":false}"#;
        match SdkMessage::from_stream_line(line) {
            Some(SdkMessage::Result {
                session_id,
                usage: Some(usage),
                is_error,
            }) => {
                assert_eq!(session_id.as_deref(), Some("sess-42"));
                assert_eq!(usage.cost_usd, Some(0.12));
                assert_eq!(usage.input_tokens, Some(100));
                assert_eq!(usage.turns, Some(3));
                assert!(!is_error);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_becomes_system() {
        let line = r#"{"type":"init","subtype":"session_start"}"#;
        match SdkMessage::from_stream_line(line) {
            Some(SdkMessage::System { subtype, .. }) => assert_eq!(subtype, "session_start"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_blank_line_is_skipped_and_garbage_is_protocol_error() {
        assert_eq!(SdkMessage::from_stream_line("   "), None);
        match SdkMessage::from_stream_line("not json at all") {
            Some(SdkMessage::StreamError { kind, .. }) => {
                assert_eq!(kind, StreamErrorKind::Protocol)
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_rate_limit_delay_honors_server_hint() {
        let kind = StreamErrorKind::RateLimited {
            retry_after_secs: Some(30),
        };
        for attempt in 1..=4 {
            assert!(kind.retry_delay(attempt) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_rate_limit_delay_caps_without_hint() {
        let kind = StreamErrorKind::RateLimited {
            retry_after_secs: None,
        };
        assert!(kind.retry_delay(10) <= Duration::from_secs(60));
    }

    #[test]
    fn test_retryability() {
        assert!(StreamErrorKind::ConnectionLost.is_retryable());
        assert!(
            !StreamErrorKind::SessionExpired.is_retryable(),
            "session expiry refreshes the session instead of retrying"
        );
        assert!(!StreamErrorKind::Cancelled.is_retryable());
    }
}
