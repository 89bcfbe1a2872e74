//! Format validation and per-step retry accounting.
//!
//! A step may declare what shape its response must take. Three kinds exist:
//! `json` validates the structured output against an inline schema,
//! `text-pattern` matches a regex and returns its captures, and
//! `action-block` locates a fenced code block of a declared language tag
//! and checks required fields and literal values inside it.
//!
//! Failing a check never aborts the run. It increments the step's format
//! retry counter and produces a retry prompt; once the budget is exhausted
//! the failure is recorded and the loop simply moves on.

use crate::extract;
use crate::schema::SchemaDocument;
use crate::summary::IterationSummary;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Declared response shape for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResponseFormat {
    /// Structured output must satisfy an inline schema (required fields and
    /// type matches).
    Json { schema: JsonValue },
    /// Any assistant response must match the regex; named capture groups
    /// are extracted.
    TextPattern { pattern: String },
    /// A fenced code block of `language` must parse as JSON and carry the
    /// required fields and literal values.
    #[serde(rename_all = "camelCase")]
    ActionBlock {
        language: String,
        #[serde(default)]
        required_fields: Vec<String>,
        #[serde(default)]
        expected_values: HashMap<String, JsonValue>,
    },
}

impl ResponseFormat {
    /// Short human description of what was expected, used by retry prompts.
    pub fn expectation(&self) -> String {
        match self {
            ResponseFormat::Json { schema } => {
                format!("a JSON object satisfying the schema {schema}")
            }
            ResponseFormat::TextPattern { pattern } => {
                format!("text matching the pattern `{pattern}`")
            }
            ResponseFormat::ActionBlock {
                language,
                required_fields,
                ..
            } => format!(
                "a fenced ```{language} block containing a JSON object with fields: {}",
                required_fields.join(", ")
            ),
        }
    }
}

/// Successful format check, carrying whatever the check extracted.
#[derive(Debug, Clone, PartialEq)]
pub enum FormatOutcome {
    JsonValid(JsonValue),
    Captures(HashMap<String, String>),
    ActionValid(JsonValue),
}

/// A failed format check.
#[derive(Debug, Clone)]
pub struct FormatViolation {
    /// One-line description of what went wrong.
    pub summary: String,
    /// Individual problems (field paths, pattern text).
    pub details: Vec<String>,
    /// Restatement of the expected format.
    pub expected: String,
}

impl FormatViolation {
    fn new(summary: impl Into<String>, details: Vec<String>, format: &ResponseFormat) -> Self {
        Self {
            summary: summary.into(),
            details,
            expected: format.expectation(),
        }
    }
}

/// Checks one iteration's output against the declared format.
pub fn validate_format(
    format: &ResponseFormat,
    summary: &IterationSummary,
) -> Result<FormatOutcome, FormatViolation> {
    match format {
        ResponseFormat::Json { schema } => {
            let Some(output) = &summary.structured_output else {
                return Err(FormatViolation::new(
                    "no structured output found in the response",
                    Vec::new(),
                    format,
                ));
            };
            let document = SchemaDocument::new(schema.clone());
            let violations = document.validate("", output);
            if violations.is_empty() {
                Ok(FormatOutcome::JsonValid(output.clone()))
            } else {
                Err(FormatViolation::new(
                    "structured output failed schema validation",
                    violations.iter().map(ToString::to_string).collect(),
                    format,
                ))
            }
        }
        ResponseFormat::TextPattern { pattern } => {
            let regex = match Regex::new(pattern) {
                Ok(regex) => regex,
                Err(e) => {
                    return Err(FormatViolation::new(
                        format!("invalid pattern declared: {e}"),
                        Vec::new(),
                        format,
                    ));
                }
            };
            let text = summary.joined_responses();
            match regex.captures(&text) {
                Some(captures) => {
                    let mut extracted = HashMap::new();
                    for name in regex.capture_names().flatten() {
                        if let Some(m) = captures.name(name) {
                            extracted.insert(name.to_string(), m.as_str().to_string());
                        }
                    }
                    Ok(FormatOutcome::Captures(extracted))
                }
                None => Err(FormatViolation::new(
                    "response did not match the declared pattern",
                    vec![pattern.clone()],
                    format,
                )),
            }
        }
        ResponseFormat::ActionBlock {
            language,
            required_fields,
            expected_values,
        } => {
            let text = summary.joined_responses();
            let Some(block) = extract::extract_fenced_block(&text, language) else {
                return Err(FormatViolation::new(
                    format!("no ```{language} block found in the response"),
                    Vec::new(),
                    format,
                ));
            };
            let value: JsonValue = match serde_json::from_str(&block) {
                Ok(value) => value,
                Err(e) => {
                    return Err(FormatViolation::new(
                        format!("```{language} block is not valid JSON: {e}"),
                        Vec::new(),
                        format,
                    ));
                }
            };
            let mut details = Vec::new();
            for field in required_fields {
                if value.get(field).is_none() {
                    details.push(format!("{field}: required field missing"));
                }
            }
            for (field, expected) in expected_values {
                match value.get(field) {
                    Some(actual) if actual == expected => {}
                    Some(actual) => {
                        details.push(format!("{field}: expected {expected}, got {actual}"))
                    }
                    None => details.push(format!("{field}: expected {expected}, field missing")),
                }
            }
            if details.is_empty() {
                Ok(FormatOutcome::ActionValid(value))
            } else {
                Err(FormatViolation::new(
                    "action block failed its declared checks",
                    details,
                    format,
                ))
            }
        }
    }
}

/// What the retry layer decided after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Budget left: re-prompt.
    Retry { attempt: u32 },
    /// Budget spent: record and move on.
    Exhausted,
}

/// Per-step retry accounting. Counters are monotone within a step and reset
/// only when a different step is entered.
#[derive(Debug, Default)]
pub struct RetryLedger {
    step_id: Option<String>,
    format_retries: u32,
    condition_attempts: u32,
    format_exhausted: bool,
    condition_exhausted: bool,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notes that `step_id` is the active step, resetting counters if the
    /// step changed.
    pub fn enter_step(&mut self, step_id: &str) {
        if self.step_id.as_deref() != Some(step_id) {
            self.step_id = Some(step_id.to_string());
            self.format_retries = 0;
            self.condition_attempts = 0;
            self.format_exhausted = false;
            self.condition_exhausted = false;
        }
    }

    pub fn note_format_failure(&mut self, max_retries: u32) -> RetryDecision {
        self.format_retries += 1;
        if self.format_retries >= max_retries {
            self.format_exhausted = true;
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                attempt: self.format_retries,
            }
        }
    }

    pub fn note_condition_failure(&mut self, max_attempts: u32) -> RetryDecision {
        self.condition_attempts += 1;
        if self.condition_attempts >= max_attempts {
            self.condition_exhausted = true;
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                attempt: self.condition_attempts,
            }
        }
    }

    pub fn format_retries(&self) -> u32 {
        self.format_retries
    }

    pub fn condition_attempts(&self) -> u32 {
        self.condition_attempts
    }

    pub fn format_exhausted(&self) -> bool {
        self.format_exhausted
    }

    pub fn condition_exhausted(&self) -> bool {
        self.condition_exhausted
    }
}
