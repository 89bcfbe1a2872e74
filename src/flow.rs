//! Flow control: which step runs next.
//!
//! The controller owns the step context (it is the only writer), resolves
//! the entry step on iteration 1, and interprets each iteration's
//! structured output through the step's gate to pick the next step.
//! `route_from` is a pure function of the gate, the transitions, and the
//! output; the mutable bookkeeping (iteration counter, routed step, loop
//! guard) lives in `apply_route` and `start_iteration`.

use crate::context::{InputBinding, StepContext};
use crate::error::{ConfigError, RunError};
use crate::registry::{Intent, StepRegistry, StructuredGate};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Consecutive-routing limit before the step-loop guard trips.
pub const STEP_LOOP_LIMIT: u32 = 10;

/// Interpreted routing decision for one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// The interpreted intent (after fallback).
    pub intent: Intent,
    /// Step to run next, when the intent names one.
    pub target: Option<String>,
    /// The intent was `complete` (or its `closing` alias).
    pub signal_completion: bool,
    /// The deprecated `closing` alias was used.
    pub via_closing_alias: bool,
}

/// Decides which step runs next and stores declared handoff data.
pub struct FlowController {
    registry: Arc<StepRegistry>,
    entry: String,
    context: StepContext,
    iteration: u32,
    current: String,
    routed_next: Option<String>,
    last_target: Option<String>,
    consecutive_routes: u32,
    loop_limit: u32,
    closing_warned: bool,
}

impl FlowController {
    pub fn new(
        registry: Arc<StepRegistry>,
        completion_type: &str,
        loop_limit: u32,
    ) -> Result<Self, ConfigError> {
        let entry = registry.entry_step_for(completion_type)?.to_string();
        registry.require(&entry, "entry step")?;
        Ok(Self {
            registry,
            current: entry.clone(),
            entry,
            context: StepContext::new(),
            iteration: 0,
            routed_next: None,
            last_target: None,
            consecutive_routes: 0,
            loop_limit,
            closing_warned: false,
        })
    }

    /// Current step id; never empty while the flow is incomplete.
    pub fn current_step_id(&self) -> &str {
        &self.current
    }

    /// 1-based iteration counter.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Starts the next iteration and returns the step it runs: the entry
    /// step for iteration 1, the previously routed step afterwards.
    pub fn start_iteration(&mut self) -> String {
        self.iteration += 1;
        if self.iteration == 1 {
            self.current = self.entry.clone();
        } else if let Some(next) = self.routed_next.take() {
            self.current = next;
        }
        debug!(
            target: "agent_harness::flow",
            "iteration {} runs step {}", self.iteration, self.current
        );
        self.current.clone()
    }

    /// Copies each declared handoff field from the structured output into
    /// the step context under `step_id`. Fields missing from the output are
    /// skipped with a warning.
    pub fn record_output(&mut self, step_id: &str, gate: &StructuredGate, output: &JsonValue) {
        if gate.handoff_fields.is_empty() {
            return;
        }
        let mut data = HashMap::new();
        for field in &gate.handoff_fields {
            match lookup_path(output, field) {
                Some(value) => {
                    let key = field.rsplit('.').next().unwrap_or(field).to_string();
                    data.insert(key, value.clone());
                }
                None => warn!(
                    target: "agent_harness::flow",
                    "handoff field {field} absent from {step_id} output"
                ),
            }
        }
        self.context.set(step_id, &data);
    }

    /// Resolves an input spec against the step context.
    pub fn uv_for(&self, spec: &[InputBinding]) -> Result<HashMap<String, String>, RunError> {
        self.context.to_uv(spec)
    }

    pub fn context(&self) -> &StepContext {
        &self.context
    }

    /// Interprets the structured output through the step's gate. Pure: the
    /// result depends only on the gate, the transitions, and the output.
    pub fn route_from(
        &self,
        step_id: &str,
        output: Option<&JsonValue>,
    ) -> Result<Route, RunError> {
        let step = self.registry.require(step_id, "routing")?;
        let Some(gate) = &step.structured_gate else {
            return Err(RunError::Config(ConfigError::InvalidDefinition(format!(
                "step {step_id} has no structuredGate to route from"
            ))));
        };
        let transitions = step.transitions.as_ref().ok_or_else(|| {
            RunError::Config(ConfigError::InvalidDefinition(format!(
                "step {step_id} has no transitions to route through"
            )))
        })?;

        let raw = output
            .and_then(|o| lookup_path(o, &gate.intent_field))
            .and_then(JsonValue::as_str);
        let parsed = raw.and_then(Intent::parse);

        let (intent, via_closing_alias) = match parsed {
            Some((intent, alias)) if gate.allowed_intents.contains(&intent) => (intent, alias),
            _ => {
                let fallback = gate.fallback_intent.ok_or_else(|| {
                    // Precluded by the loader; kept as a defensive surface.
                    RunError::Config(ConfigError::MissingFallbackIntent {
                        step_id: step_id.to_string(),
                    })
                })?;
                debug!(
                    target: "agent_harness::flow",
                    "intent {raw:?} not usable at {step_id}, falling back to {}",
                    fallback.as_str()
                );
                (fallback, false)
            }
        };

        let target = match transitions.get(&intent) {
            Some(t) => {
                if !self.registry.steps.contains_key(&t.target) {
                    return Err(RunError::Config(ConfigError::UnknownTransitionTarget {
                        step_id: step_id.to_string(),
                        target: t.target.clone(),
                    }));
                }
                Some(t.target.clone())
            }
            None => match intent {
                // End-of-flow needs no target; abort stops the run.
                Intent::Complete | Intent::Abort => None,
                // Repeating a step is its own target.
                Intent::Repeat => Some(step_id.to_string()),
                Intent::Next | Intent::Jump => {
                    return Err(RunError::Config(ConfigError::InvalidDefinition(format!(
                        "no transition declared for intent {} at step {step_id}",
                        intent.as_str()
                    ))));
                }
            },
        };

        Ok(Route {
            intent,
            target,
            signal_completion: intent == Intent::Complete,
            via_closing_alias,
        })
    }

    /// Records the routing decision for the next iteration and enforces the
    /// step-loop guard. Retry iterations are excluded from the guard.
    pub fn apply_route(&mut self, route: &Route, is_retry: bool) -> Result<(), RunError> {
        if route.via_closing_alias && !self.closing_warned {
            self.closing_warned = true;
            warn!(
                target: "agent_harness::flow",
                "intent 'closing' is deprecated; declare 'complete' instead"
            );
        }
        if route.intent == Intent::Abort {
            return Ok(());
        }
        let Some(target) = &route.target else {
            return Ok(());
        };

        if !is_retry {
            if self.last_target.as_deref() == Some(target.as_str()) {
                self.consecutive_routes += 1;
            } else {
                self.last_target = Some(target.clone());
                self.consecutive_routes = 1;
            }
            if self.consecutive_routes > self.loop_limit {
                return Err(RunError::StepLoop {
                    step_id: target.clone(),
                    count: self.consecutive_routes,
                    limit: self.loop_limit,
                });
            }
        }
        self.routed_next = Some(target.clone());
        Ok(())
    }

    /// Forces the next iteration to re-run `step_id` (retry path).
    pub fn stay_on(&mut self, step_id: &str) {
        self.routed_next = Some(step_id.to_string());
    }
}

/// Resolves a dotted path (`next_action.action`) inside a JSON value.
pub fn lookup_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut cursor = value;
    for segment in path.split('.') {
        cursor = cursor.get(segment)?;
    }
    Some(cursor)
}
