//! Completion subsystem.
//!
//! The closer gates termination. Every iteration it evaluates the agent's
//! completion strategy (budget, keyword, external state, composite), and on
//! top of that it runs the AI-declaration sub-loop: when the assistant's
//! structured output claims the work is done, the claim is verified against
//! the step's output schema or its completion conditions before it is
//! honored. A failed verification produces the retry prompt the next
//! iteration will consume.

pub mod strategy;
pub mod validator;

pub use validator::{
    CliStateProbe, CommandInvocation, CommandOutcome, CommandRunner, FailurePattern, StateProbe,
    TokioCommandRunner, ValidatorEngine, ValidatorSpec, Verdict,
};

use crate::definition::CompletionSpec;
use crate::flow::lookup_path;
use crate::format::{RetryDecision, RetryLedger};
use crate::registry::StepDefinition;
use crate::resolver::{self, PromptResolver};
use crate::schema::SchemaDocument;
use crate::summary::IterationSummary;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the closer decided for one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assessment {
    /// The run may end; `reason` names the completion path.
    Complete { reason: String },
    /// Verification failed; re-prompt with `prompt` next iteration.
    Retry { prompt: String, pattern: String },
    /// Verification failed and the retry budget is spent.
    Exhausted { pattern: String, attempts: u32 },
    /// Nothing to decide; keep iterating.
    Continue,
}

/// The completion gate for one run.
pub struct Closer {
    completion: CompletionSpec,
    resolver: Arc<PromptResolver>,
    engine: ValidatorEngine,
    schema_root: std::path::PathBuf,
}

impl Closer {
    pub fn new(
        completion: CompletionSpec,
        resolver: Arc<PromptResolver>,
        engine: ValidatorEngine,
        schema_root: std::path::PathBuf,
    ) -> Self {
        Self {
            completion,
            resolver,
            engine,
            schema_root,
        }
    }

    /// Whether a structured output declares completion: `status ==
    /// "completed"`, or a `complete`/`closing` next action.
    pub fn declares_completion(output: Option<&JsonValue>) -> bool {
        let Some(output) = output else {
            return false;
        };
        if output.get("status").and_then(JsonValue::as_str) == Some("completed") {
            return true;
        }
        matches!(
            lookup_path(output, "next_action.action").and_then(JsonValue::as_str),
            Some("complete") | Some("closing")
        )
    }

    /// Whether the strategy can finish without a verified declaration
    /// (e.g. an iteration budget that will eventually be met). Decides if a
    /// run survives an exhausted verification budget.
    pub fn can_self_terminate(&self) -> bool {
        fn check(spec: &CompletionSpec) -> bool {
            match spec {
                CompletionSpec::IterationBudget { .. } | CompletionSpec::KeywordSignal { .. } => {
                    true
                }
                CompletionSpec::ExternalState { .. } => false,
                CompletionSpec::Composite { conditions, mode } => match mode {
                    crate::definition::CompositeMode::Any => conditions.iter().any(check),
                    crate::definition::CompositeMode::All => conditions.iter().all(check),
                },
            }
        }
        check(&self.completion)
    }

    /// Assesses one finished iteration. `declared` marks that the iteration
    /// claimed completion (via structured output or a routed `complete`
    /// intent).
    pub async fn assess(
        &self,
        step: &StepDefinition,
        summary: &IterationSummary,
        iteration: u32,
        declared: bool,
        ledger: &mut RetryLedger,
    ) -> Assessment {
        if declared {
            match self.verify_declaration(step, summary).await {
                Ok(detail) => {
                    info!(
                        target: "agent_harness::closer",
                        "completion declaration verified at {}", step.step_id
                    );
                    return Assessment::Complete {
                        reason: format!("agent declared completion; {detail}"),
                    };
                }
                Err((prompt, pattern)) => {
                    let max_attempts = step
                        .completion_conditions
                        .as_ref()
                        .map(|c| c.on_failure.max_attempts)
                        .unwrap_or(3);
                    let decision = ledger.note_condition_failure(max_attempts);

                    // A satisfied base strategy still wins over a failed
                    // verification (e.g. the iteration budget is met).
                    if let Some(reason) = self.base_reason(iteration, summary).await {
                        return Assessment::Complete { reason };
                    }

                    return match decision {
                        RetryDecision::Retry { attempt } => {
                            debug!(
                                target: "agent_harness::closer",
                                "verification failed ({pattern}), retry attempt {attempt}"
                            );
                            Assessment::Retry { prompt, pattern }
                        }
                        RetryDecision::Exhausted => {
                            warn!(
                                target: "agent_harness::closer",
                                "verification budget exhausted at {} ({pattern})", step.step_id
                            );
                            Assessment::Exhausted {
                                pattern,
                                attempts: ledger.condition_attempts(),
                            }
                        }
                    };
                }
            }
        }

        if let Some(reason) = self.base_reason(iteration, summary).await {
            return Assessment::Complete { reason };
        }
        Assessment::Continue
    }

    async fn base_reason(&self, iteration: u32, summary: &IterationSummary) -> Option<String> {
        strategy::evaluate(&self.completion, iteration, Some(summary), self.engine.probe()).await
    }

    /// Verifies an AI-declared completion. Returns the verification detail
    /// on success, or the retry prompt and pattern on failure.
    ///
    /// The output schema, when declared, is the sole check; otherwise the
    /// completion conditions run in declared order and the first invalid
    /// one decides the retry pattern.
    async fn verify_declaration(
        &self,
        step: &StepDefinition,
        summary: &IterationSummary,
    ) -> Result<String, (String, String)> {
        if let Some(schema_ref) = &step.output_schema_ref {
            let path = self.schema_root.join(&schema_ref.file);
            let violations = match (SchemaDocument::from_path(&path), &summary.structured_output) {
                (Ok(document), Some(output)) => document.validate(&schema_ref.schema, output),
                (Ok(_), None) => vec![crate::schema::SchemaViolation {
                    path: "$".to_string(),
                    message: "no structured output to validate".to_string(),
                }],
                (Err(e), _) => vec![crate::schema::SchemaViolation {
                    path: "$".to_string(),
                    message: e.to_string(),
                }],
            };
            if violations.is_empty() {
                return Ok(format!("output schema {} satisfied", schema_ref.schema));
            }
            let prompt = resolver::schema_retry_prompt(&violations);
            return Err((prompt, "schema_mismatch".to_string()));
        }

        if let Some(conditions) = &step.completion_conditions {
            for (index, spec) in conditions.conditions.iter().enumerate() {
                let verdict = self
                    .engine
                    .execute(spec, summary.structured_output.as_ref())
                    .await;
                if !verdict.valid {
                    let pattern = verdict
                        .pattern
                        .unwrap_or_else(|| "condition_failed".to_string());
                    debug!(
                        target: "agent_harness::closer",
                        "condition {index} reported {pattern}"
                    );
                    let prompt = self
                        .resolver
                        .resolve_retry(step, &pattern, &verdict.params)
                        .text;
                    return Err((prompt, pattern));
                }
            }
            return Ok(format!(
                "{} completion condition(s) verified",
                conditions.conditions.len()
            ));
        }

        Ok("declaration accepted (no verification declared)".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_declares_completion_via_status() {
        let output = json!({"status": "completed"});
        assert!(Closer::declares_completion(Some(&output)));
        let output = json!({"status": "working"});
        assert!(!Closer::declares_completion(Some(&output)));
    }

    #[test]
    fn test_declares_completion_via_next_action() {
        let output = json!({"next_action": {"action": "complete"}});
        assert!(Closer::declares_completion(Some(&output)));
        let output = json!({"next_action": {"action": "closing"}});
        assert!(
            Closer::declares_completion(Some(&output)),
            "closing is honored as a completion declaration"
        );
        let output = json!({"next_action": {"action": "next"}});
        assert!(!Closer::declares_completion(Some(&output)));
        assert!(!Closer::declares_completion(None));
    }
}
