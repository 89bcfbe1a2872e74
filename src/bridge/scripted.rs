//! Scripted bridge for tests and dry runs.
//!
//! Each call to `query` pops the next scripted turn and replays its
//! messages as a stream. Prompts are recorded so tests can assert on what
//! the engine actually sent.

use super::message::{SdkMessage, StreamErrorKind, Usage};
use super::{BridgeError, MessageStream, QueryRequest, SdkBridge};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Replays pre-scripted message sequences, one per query.
pub struct ScriptedBridge {
    turns: Mutex<VecDeque<Vec<SdkMessage>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBridge {
    pub fn new() -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Appends one scripted turn (the messages one query will yield).
    pub fn with_turn(self, messages: Vec<SdkMessage>) -> Self {
        self.turns
            .lock()
            .expect("turn queue poisoned")
            .push_back(messages);
        self
    }

    /// Convenience: a turn consisting of one assistant text plus a clean
    /// terminal result on the given session.
    pub fn with_text_turn(self, text: impl Into<String>, session_id: impl Into<String>) -> Self {
        let text = text.into();
        let session_id = session_id.into();
        self.with_turn(vec![
            assistant_text(text),
            result_ok(session_id),
        ])
    }

    /// Prompts received so far, in query order.
    pub fn seen_prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompt log poisoned").clone()
    }

    /// Number of queries served so far.
    pub fn queries_served(&self) -> usize {
        self.prompts.lock().expect("prompt log poisoned").len()
    }
}

impl Default for ScriptedBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SdkBridge for ScriptedBridge {
    async fn query(&self, request: QueryRequest) -> Result<MessageStream, BridgeError> {
        self.prompts
            .lock()
            .expect("prompt log poisoned")
            .push(request.prompt.clone());

        let turn = self
            .turns
            .lock()
            .expect("turn queue poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                vec![SdkMessage::StreamError {
                    kind: StreamErrorKind::ConnectionLost,
                    message: "scripted bridge ran out of turns".to_string(),
                }]
            });
        Ok(Box::pin(futures::stream::iter(turn)))
    }
}

/// Builds an assistant text message.
pub fn assistant_text(text: impl Into<String>) -> SdkMessage {
    SdkMessage::AssistantText { text: text.into() }
}

/// Builds a clean terminal result carrying a session id.
pub fn result_ok(session_id: impl Into<String>) -> SdkMessage {
    SdkMessage::Result {
        session_id: Some(session_id.into()),
        usage: Some(Usage {
            cost_usd: Some(0.01),
            input_tokens: Some(10),
            output_tokens: Some(5),
            turns: Some(1),
        }),
        is_error: false,
    }
}

/// Builds an assistant text message that embeds a structured output block.
pub fn assistant_structured(value: &serde_json::Value) -> SdkMessage {
    SdkMessage::AssistantText {
        text: format!("```json\n{value}\n```"),
    }
}
