//! Step registry: the declarative model of an agent's flow.
//!
//! A registry maps step ids to step definitions, declares the legal
//! progression through them (`flow`), and names the entry step per
//! completion type. Load-time validation enforces the structural rules so
//! the runtime never routes into a hole: every flow step carries a gate and
//! transitions, every gate carries a fallback intent, and every transition
//! target exists.

use crate::closer::validator::ValidatorSpec;
use crate::context::InputBinding;
use crate::error::ConfigError;
use crate::format::ResponseFormat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Categorical value extracted from a structured output by a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Next,
    Repeat,
    Jump,
    Complete,
    Abort,
}

impl Intent {
    /// Parses an intent string. `closing` is accepted as a deprecated alias
    /// of `complete`; the second component reports that the alias was used.
    pub fn parse(raw: &str) -> Option<(Intent, bool)> {
        match raw {
            "next" => Some((Intent::Next, false)),
            "repeat" => Some((Intent::Repeat, false)),
            "jump" => Some((Intent::Jump, false)),
            "complete" => Some((Intent::Complete, false)),
            "closing" => Some((Intent::Complete, true)),
            "abort" => Some((Intent::Abort, false)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Next => "next",
            Intent::Repeat => "repeat",
            Intent::Jump => "jump",
            Intent::Complete => "complete",
            Intent::Abort => "abort",
        }
    }
}

/// Where one interpreted intent routes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionTarget {
    pub target: String,
}

/// Declares how a step's structured output is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredGate {
    /// Dotted path into the structured output, e.g. `next_action.action`.
    pub intent_field: String,
    /// Intents the gate accepts at this step.
    pub allowed_intents: Vec<Intent>,
    /// Used when the intent is missing or not allowed. Mandatory for any
    /// gate; enforced at load time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_intent: Option<Intent>,
    /// Dotted paths copied into the step context under the current step id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handoff_fields: Vec<String>,
}

/// Reference to a named schema inside a JSON Schema document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRef {
    pub file: String,
    pub schema: String,
}

/// Retry budget for format validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnFail {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for OnFail {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

/// Response-format check attached to a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCheck {
    pub response_format: ResponseFormat,
    #[serde(default)]
    pub on_fail: OnFail,
}

/// Retry budget for completion conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnFailure {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for OnFailure {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

/// Ordered validators that must pass before an AI-declared completion is
/// honored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionConditions {
    pub conditions: Vec<ValidatorSpec>,
    #[serde(default)]
    pub on_failure: OnFailure,
}

/// One unit of prompt-LLM-response work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Hydrated from the registry map key after load.
    #[serde(default, skip_serializing)]
    pub step_id: String,
    /// C3L coordinates; `c1` is fixed to `steps` for step prompts.
    pub c2: String,
    pub c3: String,
    #[serde(default = "default_edition")]
    pub edition: String,
    /// Names a built-in prompt used when the C3L file is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema_ref: Option<SchemaRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_spec: Vec<InputBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_gate: Option<StructuredGate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitions: Option<HashMap<Intent, TransitionTarget>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<StepCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_conditions: Option<CompletionConditions>,
}

fn default_edition() -> String {
    "default".to_string()
}

/// The loaded registry. Immutable after validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRegistry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_step_mapping: Option<HashMap<String, String>>,
    pub steps: HashMap<String, StepDefinition>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub flow: HashMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub completion_steps: HashMap<String, String>,
}

impl StepRegistry {
    /// Parses a registry from JSON text and validates it.
    pub fn from_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let mut registry: StepRegistry =
            serde_json::from_str(text).map_err(|source| ConfigError::Parse {
                path: origin.to_string(),
                source,
            })?;
        registry.hydrate();
        registry.validate()?;
        Ok(registry)
    }

    /// Reads and validates a registry file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&text, &path.display().to_string())
    }

    /// Copies each map key into its step's `step_id`.
    fn hydrate(&mut self) {
        for (id, step) in &mut self.steps {
            step.step_id = id.clone();
        }
    }

    /// Structural validation. Rejection messages name every offender.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut gateless: Vec<String> = Vec::new();
        for steps in self.flow.values() {
            for id in steps {
                let Some(step) = self.steps.get(id) else {
                    return Err(ConfigError::UnknownStep {
                        step_id: id.clone(),
                        referrer: "flow".to_string(),
                    });
                };
                if step.structured_gate.is_none() || step.transitions.is_none() {
                    if !gateless.contains(id) {
                        gateless.push(id.clone());
                    }
                }
            }
        }
        if !gateless.is_empty() {
            gateless.sort_unstable();
            return Err(ConfigError::GatelessFlowSteps { step_ids: gateless });
        }

        for (id, step) in &self.steps {
            if let Some(gate) = &step.structured_gate {
                if gate.fallback_intent.is_none() {
                    return Err(ConfigError::MissingFallbackIntent {
                        step_id: id.clone(),
                    });
                }
            }
            if let Some(transitions) = &step.transitions {
                for target in transitions.values() {
                    if !self.steps.contains_key(&target.target) {
                        return Err(ConfigError::UnknownTransitionTarget {
                            step_id: id.clone(),
                            target: target.target.clone(),
                        });
                    }
                }
            }
        }

        for (key, id) in &self.completion_steps {
            if !self.steps.contains_key(id) {
                return Err(ConfigError::UnknownStep {
                    step_id: id.clone(),
                    referrer: format!("completionSteps[{key}]"),
                });
            }
        }
        if let Some(entry) = &self.entry_step {
            if !self.steps.contains_key(entry) {
                return Err(ConfigError::UnknownStep {
                    step_id: entry.clone(),
                    referrer: "entryStep".to_string(),
                });
            }
        }
        if let Some(mapping) = &self.entry_step_mapping {
            for (completion_type, id) in mapping {
                if !self.steps.contains_key(id) {
                    return Err(ConfigError::UnknownStep {
                        step_id: id.clone(),
                        referrer: format!("entryStepMapping[{completion_type}]"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolves the entry step for a completion type.
    /// `entryStepMapping[completionType]` wins over `entryStep`; neither
    /// present is a configuration error.
    pub fn entry_step_for(&self, completion_type: &str) -> Result<&str, ConfigError> {
        if let Some(mapping) = &self.entry_step_mapping {
            if let Some(id) = mapping.get(completion_type) {
                return Ok(id);
            }
        }
        if let Some(entry) = &self.entry_step {
            return Ok(entry);
        }
        Err(ConfigError::MissingEntryStep {
            completion_type: completion_type.to_string(),
        })
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.get(id)
    }

    /// Like [`step`](Self::step), but a missing id is a configuration error.
    pub fn require(&self, id: &str, referrer: &str) -> Result<&StepDefinition, ConfigError> {
        self.steps.get(id).ok_or_else(|| ConfigError::UnknownStep {
            step_id: id.to_string(),
            referrer: referrer.to_string(),
        })
    }
}
