//! File-based loading of definitions and registries.

use agent_harness::{AgentDefinition, ConfigError, StepRegistry};
use serde_json::json;

#[test]
fn definition_and_registry_load_from_disk() {
    let dir = tempfile::tempdir().unwrap();

    let definition_path = dir.path().join("iterator.json");
    std::fs::write(
        &definition_path,
        json!({
            "name": "iterator",
            "displayName": "Iterator",
            "version": "1.2.0",
            "description": "Works an issue until it is closed.",
            "behavior": {
                "systemPromptPath": "prompts/system.md",
                "completionType": "externalState",
                "completionConfig": {
                    "probe": {"kind": "issue-state", "issue": 7, "expected": "CLOSED"}
                },
                "allowedTools": ["Bash", "Edit", "Read"],
                "permissionMode": "acceptEdits"
            },
            "parameters": [
                {"name": "issue", "description": "issue number", "required": true}
            ],
            "prompts": {"registry": "prompts/steps.json", "baseDir": "prompts"},
            "logging": {"directory": "logs", "format": "jsonl"},
            "worktree": {"enabled": true, "root": ".worktrees"}
        })
        .to_string(),
    )
    .unwrap();

    let definition = AgentDefinition::from_path(&definition_path).unwrap();
    assert_eq!(definition.name, "iterator");
    assert_eq!(definition.behavior.allowed_tools.len(), 3);
    assert_eq!(definition.behavior.completion.type_name(), "externalState");
    assert!(definition.worktree.as_ref().unwrap().enabled);

    let registry_path = dir.path().join("steps.json");
    std::fs::write(
        &registry_path,
        json!({
            "version": "1",
            "entryStepMapping": {"externalState": "initial.issue"},
            "steps": {
                "initial.issue": {
                    "c2": "initial",
                    "c3": "issue",
                    "edition": "default",
                    "fallbackKey": "initial_issue",
                    "outputSchemaRef": {"file": "outputs.json", "schema": "IssueClose"},
                    "structuredGate": {
                        "intentField": "next_action.action",
                        "allowedIntents": ["repeat", "complete"],
                        "fallbackIntent": "repeat",
                        "handoffFields": ["summary"]
                    },
                    "transitions": {
                        "repeat": {"target": "initial.issue"},
                        "complete": {"target": "complete.issue"}
                    }
                },
                "complete.issue": {
                    "c2": "complete",
                    "c3": "issue",
                    "structuredGate": {
                        "intentField": "next_action.action",
                        "allowedIntents": ["complete"],
                        "fallbackIntent": "complete"
                    },
                    "transitions": {}
                }
            },
            "flow": {"issue": ["initial.issue", "complete.issue"]},
            "completionSteps": {"complete.issue": "complete.issue"}
        })
        .to_string(),
    )
    .unwrap();

    let registry = StepRegistry::from_path(&registry_path).unwrap();
    assert_eq!(
        registry.entry_step_for("externalState").unwrap(),
        "initial.issue"
    );
    let step = registry.step("initial.issue").unwrap();
    assert_eq!(step.step_id, "initial.issue");
    assert_eq!(
        step.output_schema_ref.as_ref().unwrap().schema,
        "IssueClose"
    );
}

#[test]
fn missing_files_are_io_configuration_errors() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.json");

    match AgentDefinition::from_path(&missing) {
        Err(ConfigError::Io { path, .. }) => assert!(path.contains("nope.json")),
        other => panic!("expected Io error, got {other:?}"),
    }
    match StepRegistry::from_path(&missing) {
        Err(ConfigError::Io { .. }) => {}
        other => panic!("expected Io error, got {other:?}"),
    }
}

#[test]
fn malformed_json_is_a_parse_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{not json").unwrap();

    match StepRegistry::from_path(&path) {
        Err(ConfigError::Parse { path, .. }) => assert!(path.contains("broken.json")),
        other => panic!("expected Parse error, got {other:?}"),
    }
}
