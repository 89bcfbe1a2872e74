//! Agent definition: the immutable description of one agent.
//!
//! Loaded once per run and never mutated. The definition names the agent,
//! declares how the run may end (`CompletionSpec`), and carries the opaque
//! descriptors the engine passes through to its collaborators (tools,
//! permission mode, logging, worktree, GitHub).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};

/// Permission mode forwarded to the SDK bridge, opaque to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionMode {
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "plan")]
    Plan,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "bypassPermissions")]
    BypassPermissions,
}

impl PermissionMode {
    /// CLI flag value understood by the backend.
    pub fn as_flag(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::Plan => "plan",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "plan" => Ok(PermissionMode::Plan),
            "acceptEdits" => Ok(PermissionMode::AcceptEdits),
            "bypassPermissions" => Ok(PermissionMode::BypassPermissions),
            other => Err(format!("unknown permission mode: {other}")),
        }
    }
}

/// How a run is allowed to end. One variant per completion type, each
/// carrying its own payload; there is no default.
///
/// In the definition file this appears as the `completionType` /
/// `completionConfig` pair inside `behavior`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "completionType", content = "completionConfig", rename_all = "camelCase")]
pub enum CompletionSpec {
    /// Complete when the iteration count reaches the budget.
    #[serde(rename_all = "camelCase")]
    IterationBudget { max_iterations: u32 },
    /// Complete when an assistant response contains the keyword.
    #[serde(rename_all = "camelCase")]
    KeywordSignal {
        completion_keyword: String,
        #[serde(default = "default_case_sensitive")]
        case_sensitive: bool,
    },
    /// Complete when an external probe reports the expected state.
    #[serde(rename_all = "camelCase")]
    ExternalState { probe: StateProbeSpec },
    /// Combine conditions; evaluation order is the declared array order and
    /// `any` short-circuits on the first complete.
    #[serde(rename_all = "camelCase")]
    Composite {
        conditions: Vec<CompletionSpec>,
        mode: CompositeMode,
    },
}

fn default_case_sensitive() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositeMode {
    Any,
    All,
}

/// Descriptor of an external state probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StateProbeSpec {
    /// A GitHub issue must be in the expected state (e.g. `CLOSED`).
    #[serde(rename_all = "camelCase")]
    IssueState { issue: u64, expected: String },
    /// A git branch must be in the expected state (e.g. `merged`).
    #[serde(rename_all = "camelCase")]
    BranchState { branch: String, expected: String },
}

impl CompletionSpec {
    /// The completion type name used by `entryStepMapping` keys and
    /// completion reasons.
    pub fn type_name(&self) -> &'static str {
        match self {
            CompletionSpec::IterationBudget { .. } => "iterationBudget",
            CompletionSpec::KeywordSignal { .. } => "keywordSignal",
            CompletionSpec::ExternalState { .. } => "externalState",
            CompletionSpec::Composite { .. } => "composite",
        }
    }

    /// Structural validation, applied recursively for composites.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            CompletionSpec::IterationBudget { max_iterations } => {
                if *max_iterations == 0 {
                    return Err(ConfigError::InvalidIterationBudget(0));
                }
            }
            CompletionSpec::KeywordSignal {
                completion_keyword, ..
            } => {
                if completion_keyword.is_empty() {
                    return Err(ConfigError::EmptyCompletionKeyword);
                }
            }
            CompletionSpec::ExternalState { .. } => {}
            CompletionSpec::Composite { conditions, .. } => {
                if conditions.is_empty() {
                    return Err(ConfigError::EmptyComposite);
                }
                for condition in conditions {
                    condition.validate()?;
                }
            }
        }
        Ok(())
    }
}

/// Behavior block of the definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Behavior {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_path: Option<PathBuf>,
    #[serde(flatten)]
    pub completion: CompletionSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
}

/// CLI parameter descriptor, passed through to the thin CLI collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Prompt locations: the step registry file and the C3L base directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptsSpec {
    pub registry: PathBuf,
    pub base_dir: PathBuf,
}

/// Logging descriptor; the directory is owned by the logging collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSpec {
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_format() -> String {
    "jsonl".to_string()
}

/// Worktree descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeSpec {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

/// The declarative agent definition, immutable for the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub behavior: Behavior,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterSpec>,
    pub prompts: PromptsSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingSpec>,
    /// Opaque GitHub integration descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeSpec>,
}

impl AgentDefinition {
    /// Parses a definition from JSON text and validates it.
    pub fn from_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let definition: AgentDefinition =
            serde_json::from_str(text).map_err(|source| ConfigError::Parse {
                path: origin.to_string(),
                source,
            })?;
        definition.validate()?;
        Ok(definition)
    }

    /// Reads and validates a definition file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&text, &path.display().to_string())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidDefinition(
                "agent name must not be empty".to_string(),
            ));
        }
        self.behavior.completion.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition_json(completion_type: &str, completion_config: JsonValue) -> String {
        let behavior = json!({
            "completionType": completion_type,
            "completionConfig": completion_config,
            "allowedTools": ["Bash", "Edit"],
            "permissionMode": "acceptEdits"
        });
        json!({
            "name": "iterator",
            "displayName": "Iterator",
            "version": "1.0.0",
            "behavior": behavior,
            "prompts": {"registry": "steps.json", "baseDir": "prompts"},
            "logging": {"directory": "logs"}
        })
        .to_string()
    }

    #[test]
    fn test_parse_iteration_budget_definition() {
        let text = definition_json("iterationBudget", json!({"maxIterations": 5}));
        let def = AgentDefinition::from_str(&text, "test").unwrap();
        assert_eq!(def.name, "iterator");
        match def.behavior.completion {
            CompletionSpec::IterationBudget { max_iterations } => assert_eq!(max_iterations, 5),
            other => panic!("unexpected completion: {other:?}"),
        }
        assert_eq!(
            def.behavior.permission_mode,
            Some(PermissionMode::AcceptEdits)
        );
    }

    #[test]
    fn test_zero_iteration_budget_is_rejected() {
        let text = definition_json("iterationBudget", json!({"maxIterations": 0}));
        let err = AgentDefinition::from_str(&text, "test").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIterationBudget(0)));
    }

    #[test]
    fn test_empty_keyword_is_rejected() {
        let text = definition_json("keywordSignal", json!({"completionKeyword": ""}));
        let err = AgentDefinition::from_str(&text, "test").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCompletionKeyword));
    }

    #[test]
    fn test_keyword_is_case_sensitive_by_default() {
        let text = definition_json("keywordSignal", json!({"completionKeyword": "DONE"}));
        let def = AgentDefinition::from_str(&text, "test").unwrap();
        match def.behavior.completion {
            CompletionSpec::KeywordSignal { case_sensitive, .. } => assert!(case_sensitive),
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn test_composite_validates_recursively() {
        let text = definition_json("composite", json!({
            "mode": "any",
            "conditions": [
                {"completionType": "iterationBudget", "completionConfig": {"maxIterations": 0}}
            ]
        }));
        let err = AgentDefinition::from_str(&text, "test").unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidIterationBudget(0)),
            "nested conditions are validated"
        );
    }

    #[test]
    fn test_empty_composite_is_rejected() {
        let text = definition_json("composite", json!({
            "mode": "all",
            "conditions": []
        }));
        let err = AgentDefinition::from_str(&text, "test").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyComposite));
    }

    #[test]
    fn test_external_state_probe_round_trips() {
        let text = definition_json("externalState", json!({
            "probe": {"kind": "issue-state", "issue": 42, "expected": "CLOSED"}
        }));
        let def = AgentDefinition::from_str(&text, "test").unwrap();
        match &def.behavior.completion {
            CompletionSpec::ExternalState {
                probe: StateProbeSpec::IssueState { issue, expected },
            } => {
                assert_eq!(*issue, 42);
                assert_eq!(expected, "CLOSED");
            }
            other => panic!("unexpected completion: {other:?}"),
        }
        assert_eq!(def.behavior.completion.type_name(), "externalState");
    }
}
