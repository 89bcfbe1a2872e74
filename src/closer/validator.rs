//! Completion-condition validators.
//!
//! A validator is one of three capabilities: run a command and judge its
//! exit code, probe external state (issue, branch), or validate the step's
//! structured output against a named schema. Validators never abort a run:
//! a non-success exit means "not complete", and the first invalid verdict
//! carries a pattern name plus parameters for the retry prompt.

use crate::definition::StateProbeSpec;
use crate::schema::SchemaDocument;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Grace period between asking a subprocess to stop and force-killing it.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// One failure pattern scanned against a failing command's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePattern {
    pub name: String,
    pub regex: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub captures: Vec<String>,
}

/// Declarative validator, as written in a step's completion conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ValidatorSpec {
    /// Run a subprocess; success is an allowlisted exit code.
    #[serde(rename_all = "camelCase")]
    Command {
        argv: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default = "default_success_exit_codes")]
        success_exit_codes: Vec<i32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failure_patterns: Vec<FailurePattern>,
        /// Per-validator timeout, opaque to the engine.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        /// Pattern name reported when no failure pattern matches.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Probe external state.
    State { probe: StateProbeSpec },
    /// Validate the step's structured output against a named schema.
    Schema { file: String, schema: String },
}

fn default_success_exit_codes() -> Vec<i32> {
    vec![0]
}

/// Result of one validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
}

impl Verdict {
    pub fn valid() -> Self {
        Self {
            valid: true,
            pattern: None,
            params: HashMap::new(),
        }
    }

    pub fn invalid(pattern: impl Into<String>, params: HashMap<String, String>) -> Self {
        Self {
            valid: false,
            pattern: Some(pattern.into()),
            params,
        }
    }
}

/// A subprocess invocation, already resolved against the run context.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub cancellation: CancellationToken,
}

/// Outcome of a subprocess. `exit_code` is `None` when the process was
/// terminated by a signal; callers treat that identically to a non-zero
/// exit.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Seam for running validator subprocesses. The real implementation wraps
/// tokio; tests substitute scripted outcomes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &CommandInvocation) -> std::io::Result<CommandOutcome>;
}

/// Seam for observing external state. The real implementation shells out to
/// `gh` and `git`; tests return fixed states.
#[async_trait]
pub trait StateProbe: Send + Sync {
    /// Returns the observed state string (e.g. `CLOSED`, `merged`), or a
    /// description of why observation failed.
    async fn observe(&self, spec: &StateProbeSpec) -> Result<String, String>;
}

/// Default command runner backed by `tokio::process`.
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, invocation: &CommandInvocation) -> std::io::Result<CommandOutcome> {
        let Some((program, args)) = invocation.argv.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty argv",
            ));
        };
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(&invocation.cwd)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let timeout = invocation.timeout.unwrap_or(Duration::from_secs(3600));
        let output = tokio::select! {
            output = &mut wait => output?,
            _ = invocation.cancellation.cancelled() => {
                // The grace period lets well-behaved processes flush; the
                // kill_on_drop flag reaps the rest.
                tokio::time::sleep(KILL_GRACE).await;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "validator cancelled",
                ));
            }
            _ = tokio::time::sleep(timeout) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "validator timed out",
                ));
            }
        };

        Ok(CommandOutcome {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Default probe backed by the `gh` and `git` CLIs.
pub struct CliStateProbe {
    pub cwd: PathBuf,
}

#[async_trait]
impl StateProbe for CliStateProbe {
    async fn observe(&self, spec: &StateProbeSpec) -> Result<String, String> {
        match spec {
            StateProbeSpec::IssueState { issue, .. } => {
                let output = tokio::process::Command::new("gh")
                    .args(["issue", "view", &issue.to_string(), "--json", "state"])
                    .current_dir(&self.cwd)
                    .output()
                    .await
                    .map_err(|e| format!("gh unavailable: {e}"))?;
                if !output.status.success() {
                    return Err(format!(
                        "gh issue view failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ));
                }
                let value: JsonValue = serde_json::from_slice(&output.stdout)
                    .map_err(|e| format!("unparseable gh output: {e}"))?;
                value
                    .get("state")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| "gh output carried no state".to_string())
            }
            StateProbeSpec::BranchState { branch, .. } => {
                let output = tokio::process::Command::new("git")
                    .args(["branch", "--merged"])
                    .current_dir(&self.cwd)
                    .output()
                    .await
                    .map_err(|e| format!("git unavailable: {e}"))?;
                if !output.status.success() {
                    return Err(format!(
                        "git branch failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ));
                }
                let merged = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .any(|line| line.trim_start_matches(['*', ' ']).trim() == branch);
                Ok(if merged { "merged" } else { "unmerged" }.to_string())
            }
        }
    }
}

/// Executes validator specs through the command and probe seams.
pub struct ValidatorEngine {
    commands: std::sync::Arc<dyn CommandRunner>,
    probe: std::sync::Arc<dyn StateProbe>,
    /// Schema files in `outputSchemaRef` / schema validators resolve
    /// relative to this directory.
    schema_root: PathBuf,
    cwd: PathBuf,
    cancellation: CancellationToken,
}

impl ValidatorEngine {
    pub fn new(
        commands: std::sync::Arc<dyn CommandRunner>,
        probe: std::sync::Arc<dyn StateProbe>,
        schema_root: PathBuf,
        cwd: PathBuf,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            commands,
            probe,
            schema_root,
            cwd,
            cancellation,
        }
    }

    pub fn probe(&self) -> &dyn StateProbe {
        &*self.probe
    }

    /// Runs one validator. Failures of the machinery itself (spawn error,
    /// timeout) are verdicts, never fatal errors.
    pub async fn execute(
        &self,
        spec: &ValidatorSpec,
        structured_output: Option<&JsonValue>,
    ) -> Verdict {
        match spec {
            ValidatorSpec::Command {
                argv,
                cwd,
                env,
                success_exit_codes,
                failure_patterns,
                timeout_secs,
                name,
            } => {
                let invocation = CommandInvocation {
                    argv: argv.clone(),
                    cwd: cwd.clone().unwrap_or_else(|| self.cwd.clone()),
                    env: env.clone(),
                    timeout: timeout_secs.map(Duration::from_secs),
                    cancellation: self.cancellation.clone(),
                };
                let outcome = match self.commands.run(&invocation).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(
                            target: "agent_harness::closer",
                            "validator {argv:?} did not run: {e}"
                        );
                        return Verdict::invalid(
                            name.clone().unwrap_or_else(|| "command_failed".to_string()),
                            HashMap::from([("error".to_string(), e.to_string())]),
                        );
                    }
                };
                judge_command(outcome, success_exit_codes, failure_patterns, name.as_deref())
            }
            ValidatorSpec::State { probe } => {
                let expected = match probe {
                    StateProbeSpec::IssueState { expected, .. } => expected.clone(),
                    StateProbeSpec::BranchState { expected, .. } => expected.clone(),
                };
                match self.probe.observe(probe).await {
                    Ok(observed) if observed == expected => Verdict::valid(),
                    Ok(observed) => Verdict::invalid(
                        state_pattern(probe),
                        HashMap::from([
                            ("expected".to_string(), expected),
                            ("observed".to_string(), observed),
                        ]),
                    ),
                    Err(e) => {
                        // An unobservable state is "not complete", never fatal.
                        debug!(target: "agent_harness::closer", "probe failed: {e}");
                        Verdict::invalid(
                            state_pattern(probe),
                            HashMap::from([("error".to_string(), e)]),
                        )
                    }
                }
            }
            ValidatorSpec::Schema { file, schema } => {
                let Some(output) = structured_output else {
                    return Verdict::invalid(
                        "schema_mismatch",
                        HashMap::from([(
                            "error".to_string(),
                            "no structured output to validate".to_string(),
                        )]),
                    );
                };
                let path = self.schema_root.join(file);
                let document = match SchemaDocument::from_path(&path) {
                    Ok(document) => document,
                    Err(e) => {
                        return Verdict::invalid(
                            "schema_mismatch",
                            HashMap::from([("error".to_string(), e.to_string())]),
                        );
                    }
                };
                let violations = document.validate(schema, output);
                if violations.is_empty() {
                    Verdict::valid()
                } else {
                    let joined = violations
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    Verdict::invalid(
                        "schema_mismatch",
                        HashMap::from([("violations".to_string(), joined)]),
                    )
                }
            }
        }
    }
}

fn state_pattern(probe: &StateProbeSpec) -> &'static str {
    match probe {
        StateProbeSpec::IssueState { .. } => "issue_open",
        StateProbeSpec::BranchState { .. } => "branch_unmerged",
    }
}

/// Judges a finished command: allowlisted exit codes pass; anything else
/// (including signal termination) scans the combined output against the
/// failure patterns in declared order.
fn judge_command(
    outcome: CommandOutcome,
    success_exit_codes: &[i32],
    failure_patterns: &[FailurePattern],
    name: Option<&str>,
) -> Verdict {
    if let Some(code) = outcome.exit_code {
        if success_exit_codes.contains(&code) {
            return Verdict::valid();
        }
    }

    let combined = format!("{}\n{}", outcome.stdout, outcome.stderr);
    for pattern in failure_patterns {
        let regex = match regex::Regex::new(&pattern.regex) {
            Ok(regex) => regex,
            Err(e) => {
                warn!(
                    target: "agent_harness::closer",
                    "failure pattern {} has an invalid regex: {e}", pattern.name
                );
                continue;
            }
        };
        if let Some(captures) = regex.captures(&combined) {
            let mut params = HashMap::new();
            for (i, capture_name) in pattern.captures.iter().enumerate() {
                let value = captures
                    .name(capture_name)
                    .or_else(|| captures.get(i + 1))
                    .map(|m| m.as_str().to_string());
                if let Some(value) = value {
                    params.insert(capture_name.clone(), value);
                }
            }
            return Verdict::invalid(pattern.name.clone(), params);
        }
    }

    let mut params = HashMap::new();
    params.insert(
        "exit_code".to_string(),
        outcome
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string()),
    );
    let stderr_tail: String = outcome.stderr.chars().rev().take(400).collect::<String>();
    let stderr_tail: String = stderr_tail.chars().rev().collect();
    if !stderr_tail.trim().is_empty() {
        params.insert("detail".to_string(), stderr_tail.trim().to_string());
    }
    Verdict::invalid(name.unwrap_or("command_failed"), params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(exit_code: Option<i32>, stdout: &str, stderr: &str) -> CommandOutcome {
        CommandOutcome {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_allowlisted_exit_code_is_valid() {
        let verdict = judge_command(outcome(Some(0), "", ""), &[0], &[], None);
        assert!(verdict.valid);

        let verdict = judge_command(outcome(Some(1), "", ""), &[0, 1], &[], None);
        assert!(verdict.valid, "any allowlisted code passes");
    }

    #[test]
    fn test_first_matching_failure_pattern_wins() {
        let patterns = vec![
            FailurePattern {
                name: "dirty_tree".to_string(),
                regex: r"M (?P<files>\S+)".to_string(),
                captures: vec!["files".to_string()],
            },
            FailurePattern {
                name: "other".to_string(),
                regex: ".*".to_string(),
                captures: vec![],
            },
        ];
        let verdict = judge_command(
            outcome(Some(1), " M src/lib.rs\n", ""),
            &[0],
            &patterns,
            None,
        );
        assert!(!verdict.valid);
        assert_eq!(verdict.pattern.as_deref(), Some("dirty_tree"));
        assert_eq!(verdict.params["files"], "src/lib.rs");
    }

    #[test]
    fn test_signal_exit_is_treated_like_nonzero() {
        let verdict = judge_command(outcome(None, "", "killed"), &[0], &[], None);
        assert!(!verdict.valid);
        assert_eq!(verdict.params["exit_code"], "signal");
    }

    #[test]
    fn test_unmatched_failure_uses_declared_name() {
        let verdict = judge_command(outcome(Some(2), "", "boom"), &[0], &[], Some("tests_failed"));
        assert_eq!(verdict.pattern.as_deref(), Some("tests_failed"));
        assert_eq!(verdict.params["detail"], "boom");
    }

    #[test]
    fn test_positional_captures_map_to_declared_names() {
        let patterns = vec![FailurePattern {
            name: "tests_failed".to_string(),
            regex: r"(\d+) failed".to_string(),
            captures: vec!["count".to_string()],
        }];
        let verdict = judge_command(outcome(Some(1), "3 failed, 7 passed", ""), &[0], &patterns, None);
        assert_eq!(verdict.params["count"], "3");
    }

    struct FixedProbe(String);

    #[async_trait]
    impl StateProbe for FixedProbe {
        async fn observe(&self, _spec: &StateProbeSpec) -> Result<String, String> {
            Ok(self.0.clone())
        }
    }

    struct NoCommands;

    #[async_trait]
    impl CommandRunner for NoCommands {
        async fn run(&self, _invocation: &CommandInvocation) -> std::io::Result<CommandOutcome> {
            panic!("no command expected in this test");
        }
    }

    fn engine(probe_state: &str) -> ValidatorEngine {
        ValidatorEngine::new(
            std::sync::Arc::new(NoCommands),
            std::sync::Arc::new(FixedProbe(probe_state.to_string())),
            PathBuf::from("."),
            PathBuf::from("."),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_state_validator_compares_observed_to_expected() {
        let spec = ValidatorSpec::State {
            probe: StateProbeSpec::IssueState {
                issue: 42,
                expected: "CLOSED".to_string(),
            },
        };
        let verdict = engine("CLOSED").execute(&spec, None).await;
        assert!(verdict.valid);

        let verdict = engine("OPEN").execute(&spec, None).await;
        assert!(!verdict.valid);
        assert_eq!(verdict.pattern.as_deref(), Some("issue_open"));
        assert_eq!(verdict.params["observed"], "OPEN");
    }

    #[tokio::test]
    async fn test_schema_validator_reads_the_referenced_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("outputs.json"),
            serde_json::json!({
                "$defs": {"Close": {"type": "object", "required": ["action"]}}
            })
            .to_string(),
        )
        .unwrap();

        let engine = ValidatorEngine::new(
            std::sync::Arc::new(NoCommands),
            std::sync::Arc::new(FixedProbe(String::new())),
            dir.path().to_path_buf(),
            PathBuf::from("."),
            CancellationToken::new(),
        );
        let spec = ValidatorSpec::Schema {
            file: "outputs.json".to_string(),
            schema: "Close".to_string(),
        };

        let good = serde_json::json!({"action": "close"});
        assert!(engine.execute(&spec, Some(&good)).await.valid);

        let bad = serde_json::json!({});
        let verdict = engine.execute(&spec, Some(&bad)).await;
        assert!(!verdict.valid);
        assert_eq!(verdict.pattern.as_deref(), Some("schema_mismatch"));

        let verdict = engine.execute(&spec, None).await;
        assert!(!verdict.valid, "missing structured output cannot satisfy a schema");
    }
}
