//! SDK bridge boundary.
//!
//! The engine never talks to an LLM transport directly. It hands a
//! [`QueryRequest`] to an [`SdkBridge`] and consumes the resulting stream of
//! [`SdkMessage`]s in arrival order. The default backend wraps the `claude`
//! CLI in streaming JSON mode; tests script the stream instead.

pub mod claude_cli;
pub mod message;
pub mod scripted;

pub use claude_cli::ClaudeCliBridge;
pub use message::{SdkMessage, StreamErrorKind, Usage};
pub use scripted::ScriptedBridge;

use crate::definition::PermissionMode;
use async_trait::async_trait;
use futures::Stream;
use std::path::PathBuf;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A pinned, boxed stream of SDK messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = SdkMessage> + Send>>;

/// One LLM round-trip request.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// The user prompt for this iteration.
    pub prompt: String,
    /// Optional system prompt, applied per query.
    pub system_prompt: Option<String>,
    /// Session to resume; `None` starts a new session.
    pub session_id: Option<String>,
    /// Tool allowlist, passed through opaquely.
    pub allowed_tools: Vec<String>,
    /// Permission mode, passed through opaquely.
    pub permission_mode: Option<PermissionMode>,
    /// Working directory for the backend process.
    pub cwd: Option<PathBuf>,
    /// Cancellation propagates into the stream read.
    pub cancellation: CancellationToken,
}

impl QueryRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            session_id: None,
            allowed_tools: Vec::new(),
            permission_mode: None,
            cwd: None,
            cancellation: CancellationToken::new(),
        }
    }
}

/// Failure to even open a stream (the stream itself reports failures as
/// [`SdkMessage::StreamError`] items).
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn backend process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// An opaque LLM transport that accepts a prompt and yields a stream of
/// typed messages with a session id.
#[async_trait]
pub trait SdkBridge: Send + Sync {
    /// Opens a streamed query. Messages arrive in stream order; the terminal
    /// `Result` message fixes the session id.
    async fn query(&self, request: QueryRequest) -> Result<MessageStream, BridgeError>;

    /// Checks whether the backend can be used at all.
    async fn is_available(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}
