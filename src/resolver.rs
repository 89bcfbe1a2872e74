//! Prompt resolution.
//!
//! A step's prompt is located by its 3-level categorical path (C3L):
//! `<base>/<c1>/<c2>/<c3>/f_<edition>.md`, where `c1` is `steps` for step
//! prompts and `retry` for pattern-specific retry prompts. A missing file
//! falls back to the in-memory library keyed by `fallbackKey`, and a
//! missing key falls back to a generic template that at minimum names the
//! step and its variables.
//!
//! Resolution is pure: the same step and variable bag produce byte-identical
//! output, and undefined variables are left intact with a recorded warning,
//! never an error.

use crate::error::RunError;
use crate::format::FormatViolation;
use crate::registry::StepDefinition;
use crate::schema::SchemaViolation;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Variable bag for substitution: `{uv-<name>}` comes from `uv`,
/// `{<name>}` from `custom`.
#[derive(Debug, Clone, Default)]
pub struct PromptVars {
    pub uv: HashMap<String, String>,
    pub custom: HashMap<String, String>,
}

impl PromptVars {
    pub fn from_uv(uv: HashMap<String, String>) -> Self {
        Self {
            uv,
            custom: HashMap::new(),
        }
    }
}

/// Where the resolved text came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
    File(PathBuf),
    Fallback(String),
    Generic,
}

/// Final prompt plus resolution metadata.
#[derive(Debug, Clone)]
pub struct ResolvedPrompt {
    pub text: String,
    pub source: PromptSource,
    /// Undefined variables encountered during substitution.
    pub warnings: Vec<String>,
}

/// Resolves step ids and retry patterns into final prompt strings.
pub struct PromptResolver {
    base_dir: PathBuf,
    library: HashMap<String, String>,
}

impl PromptResolver {
    /// A resolver rooted at `base_dir`, seeded with the built-in library.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            library: default_library(),
        }
    }

    /// Adds or replaces one library entry.
    pub fn with_entry(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        self.library.insert(key.into(), template.into());
        self
    }

    /// Resolves the prompt for a step.
    pub fn resolve(
        &self,
        step: &StepDefinition,
        vars: &PromptVars,
    ) -> Result<ResolvedPrompt, RunError> {
        let path = self.c3l_path("steps", &step.c2, &step.c3, &step.edition);
        if let Some(text) = read_template(&path) {
            return Ok(substitute(text, PromptSource::File(path), vars));
        }
        if let Some(key) = &step.fallback_key {
            if let Some(template) = self.library.get(key) {
                return Ok(substitute(
                    template.clone(),
                    PromptSource::Fallback(key.clone()),
                    vars,
                ));
            }
        }
        let generic = generic_template(&step.step_id, vars);
        Ok(substitute(generic, PromptSource::Generic, vars))
    }

    /// Resolves a pattern-specific retry prompt (`c1 = retry`,
    /// `c2 = pattern`). Falls back to the `retry.<pattern>` library entry,
    /// then to the generic retry template.
    pub fn resolve_retry(
        &self,
        step: &StepDefinition,
        pattern: &str,
        params: &HashMap<String, String>,
    ) -> ResolvedPrompt {
        let mut vars = PromptVars::default();
        vars.custom.extend(params.clone());

        let path = self.c3l_path("retry", pattern, &step.c3, &step.edition);
        if let Some(text) = read_template(&path) {
            return substitute(text, PromptSource::File(path), &vars);
        }
        let key = format!("retry.{pattern}");
        if let Some(template) = self.library.get(&key) {
            return substitute(template.clone(), PromptSource::Fallback(key), &vars);
        }
        let generic = render_builtin(
            GENERIC_RETRY_TEMPLATE,
            context! { pattern => pattern, params => params },
        )
        .unwrap_or_else(|_| format!("{pattern}: the completion check failed; fix it and retry."));
        substitute(generic, PromptSource::Generic, &vars)
    }

    fn c3l_path(&self, c1: &str, c2: &str, c3: &str, edition: &str) -> PathBuf {
        self.base_dir
            .join(c1)
            .join(c2)
            .join(c3)
            .join(format!("f_{edition}.md"))
    }
}

fn read_template(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

/// Replaces `{uv-<name>}` and `{<custom>}` occurrences. Unknown variables
/// stay in place and are reported as warnings.
fn substitute(template: String, source: PromptSource, vars: &PromptVars) -> ResolvedPrompt {
    static VAR_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = VAR_PATTERN
        .get_or_init(|| Regex::new(r"\{(uv-[A-Za-z0-9_-]+|[A-Za-z0-9_]+)\}").expect("static regex"));

    let mut warnings = Vec::new();
    let text = pattern
        .replace_all(&template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            let value = if let Some(uv_name) = name.strip_prefix("uv-") {
                vars.uv.get(&format!("uv-{uv_name}"))
            } else {
                vars.custom.get(name)
            };
            match value {
                Some(value) => value.clone(),
                None => {
                    warnings.push(format!("undefined prompt variable: {name}"));
                    caps[0].to_string()
                }
            }
        })
        .into_owned();

    ResolvedPrompt {
        text,
        source,
        warnings,
    }
}

/// Minimal prompt when neither a file nor a fallback exists.
fn generic_template(step_id: &str, vars: &PromptVars) -> String {
    let mut names: Vec<&String> = vars.uv.keys().chain(vars.custom.keys()).collect();
    names.sort_unstable();
    let listing = names
        .iter()
        .map(|name| format!("{{{name}}}"))
        .collect::<Vec<_>>()
        .join("\n");
    if listing.is_empty() {
        format!("Execute step {step_id}.")
    } else {
        format!("Execute step {step_id} with the following inputs:\n{listing}")
    }
}

/// Renders one of the built-in minijinja templates.
pub(crate) fn render_builtin<S: Serialize>(
    template: &str,
    ctx: S,
) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("builtin", template)?;
    env.get_template("builtin")?.render(ctx)
}

const GENERIC_RETRY_TEMPLATE: &str = "\
{{ pattern }}: the completion check failed.
{% if params %}Details:
{% for key, value in params|items %}- {{ key }}: {{ value }}
{% endfor %}{% endif %}\
Address the problem above, then declare completion again.";

const FORMAT_RETRY_TEMPLATE: &str = "\
Your previous response was not in the expected format.

Problem: {{ summary }}
{% if details %}{% for detail in details %}- {{ detail }}
{% endfor %}{% endif %}
Respond again with {{ expected }}.";

const SCHEMA_RETRY_TEMPLATE: &str = "\
Your completion declaration did not satisfy the output schema.
{% for violation in violations %}- {{ violation }}
{% endfor %}
Emit the structured output again with these fields corrected, then declare completion.";

/// Built-in re-request prompt for a format violation.
pub fn format_retry_prompt(violation: &FormatViolation) -> String {
    render_builtin(
        FORMAT_RETRY_TEMPLATE,
        context! {
            summary => violation.summary,
            details => violation.details,
            expected => violation.expected,
        },
    )
    .unwrap_or_else(|_| {
        format!(
            "Your previous response was not in the expected format ({}). Respond again with {}.",
            violation.summary, violation.expected
        )
    })
}

/// Built-in re-request prompt citing the failing schema fields.
pub fn schema_retry_prompt(violations: &[SchemaViolation]) -> String {
    let rendered: Vec<String> = violations.iter().map(ToString::to_string).collect();
    render_builtin(SCHEMA_RETRY_TEMPLATE, context! { violations => rendered })
        .unwrap_or_else(|_| format!("Schema validation failed: {rendered:?}"))
}

/// The built-in prompt library: pattern-keyed retry templates. Each entry
/// begins with its pattern key so logs and tests can identify which
/// template fired.
fn default_library() -> HashMap<String, String> {
    let mut library = HashMap::new();
    library.insert(
        "retry.dirty_tree".to_string(),
        "dirty_tree: the working tree still has uncommitted changes.\n\
         Commit or discard every change ({files}), then declare completion again."
            .to_string(),
    );
    library.insert(
        "retry.tests_failed".to_string(),
        "tests_failed: the test command exited non-zero.\n\
         Fix the failing tests ({detail}), then declare completion again."
            .to_string(),
    );
    library.insert(
        "retry.lint_failed".to_string(),
        "lint_failed: the lint command reported problems.\n\
         Resolve every finding ({detail}), then declare completion again."
            .to_string(),
    );
    library.insert(
        "retry.issue_open".to_string(),
        "issue_open: the tracked issue is still open.\n\
         Finish the remaining work and close it, then declare completion again."
            .to_string(),
    );
    library
}
