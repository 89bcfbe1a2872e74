//! Base completion strategies.
//!
//! Each completion type maps to one check: budget, keyword, external state,
//! or a composite of those. Evaluation returns the completion reason when
//! the run may stop, `None` otherwise.

use super::validator::StateProbe;
use crate::definition::{CompletionSpec, CompositeMode, StateProbeSpec};
use crate::summary::IterationSummary;
use futures::future::BoxFuture;
use tracing::debug;

/// Evaluates the completion strategy for the current iteration.
///
/// `latest` is the summary of the iteration that just finished; it is
/// `None` only before the first iteration. Composite conditions are
/// evaluated in declared order; `any` short-circuits on the first complete.
pub fn evaluate<'a>(
    spec: &'a CompletionSpec,
    iteration: u32,
    latest: Option<&'a IterationSummary>,
    probe: &'a dyn StateProbe,
) -> BoxFuture<'a, Option<String>> {
    Box::pin(async move {
        match spec {
            CompletionSpec::IterationBudget { max_iterations } => {
                if iteration >= *max_iterations {
                    Some(format!(
                        "iteration budget reached ({iteration}/{max_iterations})"
                    ))
                } else {
                    None
                }
            }
            CompletionSpec::KeywordSignal {
                completion_keyword,
                case_sensitive,
            } => {
                let hit = latest
                    .map(|summary| summary.contains_keyword(completion_keyword, *case_sensitive))
                    .unwrap_or(false);
                if hit {
                    Some(format!(
                        "completion keyword \"{completion_keyword}\" observed"
                    ))
                } else {
                    None
                }
            }
            CompletionSpec::ExternalState { probe: probe_spec } => {
                external_reason(probe_spec, probe).await
            }
            CompletionSpec::Composite { conditions, mode } => {
                let mut reasons = Vec::new();
                for condition in conditions {
                    let reason = evaluate(condition, iteration, latest, probe).await;
                    match (mode, reason) {
                        (CompositeMode::Any, Some(reason)) => {
                            return Some(format!("composite(any): {reason}"));
                        }
                        (CompositeMode::Any, None) => {}
                        (CompositeMode::All, Some(reason)) => reasons.push(reason),
                        (CompositeMode::All, None) => return None,
                    }
                }
                match mode {
                    CompositeMode::Any => None,
                    CompositeMode::All => Some(format!("composite(all): {}", reasons.join("; "))),
                }
            }
        }
    })
}

async fn external_reason(spec: &StateProbeSpec, probe: &dyn StateProbe) -> Option<String> {
    let expected = match spec {
        StateProbeSpec::IssueState { expected, .. } => expected,
        StateProbeSpec::BranchState { expected, .. } => expected,
    };
    match probe.observe(spec).await {
        Ok(observed) if &observed == expected => Some(match spec {
            StateProbeSpec::IssueState { issue, .. } => {
                format!("external state verified: issue {issue} is {expected}")
            }
            StateProbeSpec::BranchState { branch, .. } => {
                format!("external state verified: branch {branch} is {expected}")
            }
        }),
        Ok(observed) => {
            debug!(
                target: "agent_harness::closer",
                "external state not reached: expected {expected}, observed {observed}"
            );
            None
        }
        Err(e) => {
            // An unobservable probe is "not complete", never fatal.
            debug!(target: "agent_harness::closer", "probe failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedProbe(&'static str);

    #[async_trait]
    impl StateProbe for FixedProbe {
        async fn observe(&self, _spec: &StateProbeSpec) -> Result<String, String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingProbe;

    #[async_trait]
    impl StateProbe for FailingProbe {
        async fn observe(&self, _spec: &StateProbeSpec) -> Result<String, String> {
            Err("gh unavailable".to_string())
        }
    }

    fn summary_with(text: &str) -> IterationSummary {
        let mut summary = IterationSummary::new(1, "a.b");
        summary.responses.push(text.to_string());
        summary
    }

    #[tokio::test]
    async fn test_budget_completes_at_the_budget() {
        let spec = CompletionSpec::IterationBudget { max_iterations: 3 };
        let probe = FixedProbe("");
        assert!(evaluate(&spec, 2, None, &probe).await.is_none());
        let reason = evaluate(&spec, 3, None, &probe).await.unwrap();
        assert!(reason.contains("iteration budget"));
    }

    #[tokio::test]
    async fn test_keyword_checks_the_latest_summary() {
        let spec = CompletionSpec::KeywordSignal {
            completion_keyword: "DONE".to_string(),
            case_sensitive: true,
        };
        let probe = FixedProbe("");
        let working = summary_with("working...");
        assert!(evaluate(&spec, 1, Some(&working), &probe).await.is_none());

        let done = summary_with("all DONE here");
        let reason = evaluate(&spec, 2, Some(&done), &probe).await.unwrap();
        assert!(reason.contains("DONE"));
    }

    #[tokio::test]
    async fn test_external_state_matches_expected() {
        let spec = CompletionSpec::ExternalState {
            probe: StateProbeSpec::IssueState {
                issue: 42,
                expected: "CLOSED".to_string(),
            },
        };
        assert!(evaluate(&spec, 1, None, &FixedProbe("OPEN")).await.is_none());
        let reason = evaluate(&spec, 1, None, &FixedProbe("CLOSED")).await.unwrap();
        assert!(reason.contains("issue 42 is CLOSED"));
    }

    #[tokio::test]
    async fn test_probe_failure_is_not_complete_and_not_fatal() {
        let spec = CompletionSpec::ExternalState {
            probe: StateProbeSpec::IssueState {
                issue: 1,
                expected: "CLOSED".to_string(),
            },
        };
        assert!(evaluate(&spec, 1, None, &FailingProbe).await.is_none());
    }

    #[tokio::test]
    async fn test_composite_any_short_circuits_in_declared_order() {
        let spec = CompletionSpec::Composite {
            mode: CompositeMode::Any,
            conditions: vec![
                CompletionSpec::IterationBudget { max_iterations: 10 },
                CompletionSpec::KeywordSignal {
                    completion_keyword: "DONE".to_string(),
                    case_sensitive: true,
                },
            ],
        };
        let done = summary_with("DONE");
        let reason = evaluate(&spec, 1, Some(&done), &FixedProbe("")).await.unwrap();
        assert!(reason.contains("composite(any)"));
        assert!(reason.contains("DONE"));
    }

    #[tokio::test]
    async fn test_composite_all_requires_every_condition() {
        let spec = CompletionSpec::Composite {
            mode: CompositeMode::All,
            conditions: vec![
                CompletionSpec::IterationBudget { max_iterations: 2 },
                CompletionSpec::KeywordSignal {
                    completion_keyword: "DONE".to_string(),
                    case_sensitive: true,
                },
            ],
        };
        let done = summary_with("DONE");
        assert!(
            evaluate(&spec, 1, Some(&done), &FixedProbe("")).await.is_none(),
            "budget not yet met"
        );
        let reason = evaluate(&spec, 2, Some(&done), &FixedProbe("")).await.unwrap();
        assert!(reason.contains("composite(all)"));
    }
}
