//! Namespaced handoff store.
//!
//! Each step's declared handoff data lives under its own step id; nothing
//! is shared implicitly. `to_uv` is the only sanctioned route from stored
//! outputs into prompt variables.

use crate::error::RunError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// One entry of a step's input spec: pull `from` (`"stepId.key"`) into the
/// prompt variable `uv-<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputBinding {
    pub name: String,
    pub from: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

fn default_required() -> bool {
    true
}

/// The per-run, namespaced store of step outputs.
#[derive(Debug, Default)]
pub struct StepContext {
    entries: HashMap<String, HashMap<String, JsonValue>>,
}

impl StepContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever was stored under `step_id`. Values are copied, so
    /// later mutation of the caller's map does not alter the stored data.
    pub fn set(&mut self, step_id: &str, data: &HashMap<String, JsonValue>) {
        self.entries.insert(step_id.to_string(), data.clone());
    }

    /// Reads one value. Missing step or key returns `None`, never an error.
    pub fn get(&self, step_id: &str, key: &str) -> Option<&JsonValue> {
        self.entries.get(step_id).and_then(|m| m.get(key))
    }

    /// Resolves an input spec into the flat `uv-<name>` variable map.
    ///
    /// Keys are exactly `uv-` + name for every binding with a resolved
    /// value. Missing + required raises `MissingRequiredInput`; missing +
    /// optional without a default is skipped; non-string values are
    /// stringified as JSON.
    pub fn to_uv(&self, spec: &[InputBinding]) -> Result<HashMap<String, String>, RunError> {
        let mut uv = HashMap::new();
        for binding in spec {
            let resolved = self.lookup(&binding.from);
            let value = match resolved {
                Some(value) => Some(stringify(value)),
                None => binding.default.clone(),
            };
            match value {
                Some(value) => {
                    uv.insert(format!("uv-{}", binding.name), value);
                }
                None if binding.required => {
                    return Err(RunError::MissingRequiredInput {
                        name: binding.name.clone(),
                        from: binding.from.clone(),
                    });
                }
                None => {}
            }
        }
        Ok(uv)
    }

    /// Step ids are dotted (`initial.issue`), so `from` splits on the last
    /// separator: `initial.issue.summary` reads key `summary` of step
    /// `initial.issue`.
    fn lookup(&self, from: &str) -> Option<&JsonValue> {
        let (step_id, key) = from.rsplit_once('.')?;
        self.get(step_id, key)
    }
}

fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binding(name: &str, from: &str, required: bool, default: Option<&str>) -> InputBinding {
        InputBinding {
            name: name.to_string(),
            from: from.to_string(),
            required,
            default: default.map(str::to_string),
        }
    }

    #[test]
    fn test_set_replaces_prior_data() {
        let mut ctx = StepContext::new();
        let mut data = HashMap::new();
        data.insert("summary".to_string(), json!("old"));
        ctx.set("initial.issue", &data);

        let mut newer = HashMap::new();
        newer.insert("next".to_string(), json!("fresh"));
        ctx.set("initial.issue", &newer);

        assert!(ctx.get("initial.issue", "summary").is_none());
        assert_eq!(ctx.get("initial.issue", "next"), Some(&json!("fresh")));
    }

    #[test]
    fn test_set_copies_defensively() {
        let mut ctx = StepContext::new();
        let mut data = HashMap::new();
        data.insert("summary".to_string(), json!("original"));
        ctx.set("initial.issue", &data);

        data.insert("summary".to_string(), json!("mutated"));
        assert_eq!(
            ctx.get("initial.issue", "summary"),
            Some(&json!("original")),
            "mutating the caller's map must not alter stored values"
        );
    }

    #[test]
    fn test_get_missing_returns_none() {
        let ctx = StepContext::new();
        assert!(ctx.get("nope.nope", "key").is_none());
    }

    #[test]
    fn test_to_uv_keys_are_exactly_the_resolved_bindings() {
        let mut ctx = StepContext::new();
        let mut data = HashMap::new();
        data.insert("summary".to_string(), json!("done"));
        data.insert("count".to_string(), json!(3));
        ctx.set("initial.issue", &data);

        let spec = vec![
            binding("summary", "initial.issue.summary", true, None),
            binding("count", "initial.issue.count", true, None),
            binding("absent", "initial.issue.absent", false, None),
        ];
        let uv = ctx.to_uv(&spec).unwrap();

        let mut keys: Vec<&str> = uv.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["uv-count", "uv-summary"]);
        assert_eq!(uv["uv-summary"], "done");
        assert_eq!(uv["uv-count"], "3", "non-strings are stringified");
    }

    #[test]
    fn test_to_uv_missing_required_is_an_error() {
        let ctx = StepContext::new();
        let spec = vec![binding("x", "a.b.x", true, None)];
        match ctx.to_uv(&spec) {
            Err(RunError::MissingRequiredInput { name, from }) => {
                assert_eq!(name, "x");
                assert_eq!(from, "a.b.x");
            }
            other => panic!("expected MissingRequiredInput, got {other:?}"),
        }
    }

    #[test]
    fn test_to_uv_default_fills_missing_value() {
        let ctx = StepContext::new();
        let spec = vec![binding("x", "a.b.x", true, Some("fallback"))];
        let uv = ctx.to_uv(&spec).unwrap();
        assert_eq!(uv["uv-x"], "fallback");
    }

    #[test]
    fn test_from_splits_on_last_dot() {
        let mut ctx = StepContext::new();
        let mut data = HashMap::new();
        data.insert("plan".to_string(), json!({"a": 1}));
        ctx.set("continuation.issue", &data);

        let spec = vec![binding("plan", "continuation.issue.plan", true, None)];
        let uv = ctx.to_uv(&spec).unwrap();
        assert_eq!(uv["uv-plan"], "{\"a\":1}");
    }
}
