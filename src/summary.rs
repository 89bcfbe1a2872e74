//! Records of what a run did: one `IterationSummary` per LLM round-trip,
//! one `AgentResult` per run.
//!
//! Summaries accumulate monotonically and are never revised after being
//! appended.

use crate::bridge::message::{StreamErrorKind, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

/// Where an iteration error came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationErrorKind {
    /// Surfaced by the SDK stream.
    Stream(StreamErrorKind),
    /// The response failed its declared format check.
    FormatValidation,
    /// The structured output failed a schema check.
    SchemaValidation,
}

/// One failure recorded against an iteration, kept in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationError {
    pub kind: IterationErrorKind,
    pub message: String,
}

impl IterationError {
    pub fn stream(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: IterationErrorKind::Stream(kind),
            message: message.into(),
        }
    }
}

/// The record of one LLM round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSummary {
    /// 1-based iteration index.
    pub iteration: u32,
    /// Session id after this iteration; fixed by the terminal result
    /// message when one arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Step that produced this iteration.
    pub step_id: String,
    /// Assistant text responses, in stream order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub responses: Vec<String>,
    /// Names of tools observed during the iteration.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tools_used: BTreeSet<String>,
    /// Errors surfaced by the stream, in arrival order. May include
    /// validation errors recorded by the retry layer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<IterationError>,
    /// Decoded structured output, when the assistant emitted one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl IterationSummary {
    pub fn new(iteration: u32, step_id: impl Into<String>) -> Self {
        Self {
            iteration,
            session_id: None,
            step_id: step_id.into(),
            responses: Vec::new(),
            tools_used: BTreeSet::new(),
            errors: Vec::new(),
            structured_output: None,
            usage: None,
        }
    }

    /// Whether any response contains `keyword` (substring match).
    pub fn contains_keyword(&self, keyword: &str, case_sensitive: bool) -> bool {
        if case_sensitive {
            self.responses.iter().any(|r| r.contains(keyword))
        } else {
            let keyword = keyword.to_lowercase();
            self.responses
                .iter()
                .any(|r| r.to_lowercase().contains(&keyword))
        }
    }

    /// All assistant text of this iteration, newline-joined.
    pub fn joined_responses(&self) -> String {
        self.responses.join("\n")
    }
}

/// Outcome of a run. `reason` is never empty: it names the completion path
/// on success and the failure cause otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub reason: String,
    pub iterations: u32,
    pub summaries: Vec<IterationSummary>,
}

impl AgentResult {
    pub fn succeeded(reason: impl Into<String>, summaries: Vec<IterationSummary>) -> Self {
        let reason = reason.into();
        debug_assert!(!reason.is_empty());
        Self {
            success: true,
            iterations: summaries.len() as u32,
            reason,
            summaries,
        }
    }

    pub fn failed(reason: impl Into<String>, summaries: Vec<IterationSummary>) -> Self {
        let reason = reason.into();
        let reason = if reason.is_empty() {
            "unspecified failure".to_string()
        } else {
            reason
        };
        Self {
            success: false,
            iterations: summaries.len() as u32,
            reason,
            summaries,
        }
    }

    /// One-line human summary for stdout, with per-iteration statistics
    /// when the SDK provided usage data.
    pub fn render_summary(&self) -> String {
        let mut out = format!(
            "{}: {} ({} iteration{})",
            if self.success { "success" } else { "failure" },
            self.reason,
            self.iterations,
            if self.iterations == 1 { "" } else { "s" },
        );
        for summary in &self.summaries {
            if let Some(usage) = &summary.usage {
                out.push_str(&format!(
                    "\n  iteration {}: cost ${:.4}, tokens {}/{}, turns {}",
                    summary.iteration,
                    usage.cost_usd.unwrap_or(0.0),
                    usage.input_tokens.unwrap_or(0),
                    usage.output_tokens.unwrap_or(0),
                    usage.turns.unwrap_or(0),
                ));
            }
        }
        out
    }
}
