//! The runner: one run, end-to-end.
//!
//! The runner validates the definition and registry, builds the resolver,
//! flow controller, closer and iteration executor, then drives the main
//! loop: resolve the step's prompt (or consume a pending retry prompt),
//! execute one round-trip, check the response format, interpret the gate,
//! ask the closer whether the run may end, and pick the next step.
//!
//! Expected failure modes never propagate: every error becomes an
//! [`AgentResult`] with `success = false` and a reason naming the cause.
//! The loop is single-task cooperative; the only suspension points are the
//! SDK stream, validator subprocesses, and file reads.

use crate::bridge::{SdkBridge, StreamErrorKind};
use crate::closer::{
    Assessment, CliStateProbe, Closer, CommandRunner, StateProbe, TokioCommandRunner,
    ValidatorEngine,
};
use crate::config::RunConfig;
use crate::definition::AgentDefinition;
use crate::error::{ConfigError, RunError};
use crate::executor::{IterationExecutor, IterationRequest};
use crate::flow::FlowController;
use crate::format::{validate_format, RetryDecision, RetryLedger};
use crate::logging::{self, JsonlLogger};
use crate::registry::{Intent, StepRegistry};
use crate::resolver::{self, PromptResolver, PromptVars};
use crate::summary::{AgentResult, IterationError, IterationErrorKind, IterationSummary};
use crate::worktree::WorktreeSession;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bounded attempts per iteration for retryable transport failures.
const TRANSPORT_ATTEMPTS: u32 = 3;

/// Ambient inputs of one run, threaded explicitly through the components.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub cwd: PathBuf,
    pub cancellation: CancellationToken,
}

impl RunContext {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Owns one run end-to-end.
pub struct Runner {
    definition: AgentDefinition,
    registry: Arc<StepRegistry>,
    config: RunConfig,
    bridge: Arc<dyn SdkBridge>,
    commands: Arc<dyn CommandRunner>,
    probe: Option<Arc<dyn StateProbe>>,
    started: AtomicBool,
}

impl Runner {
    pub fn new(
        definition: AgentDefinition,
        registry: StepRegistry,
        config: RunConfig,
        bridge: Arc<dyn SdkBridge>,
    ) -> Self {
        Self {
            definition,
            registry: Arc::new(registry),
            config,
            bridge,
            commands: Arc::new(TokioCommandRunner),
            probe: None,
            started: AtomicBool::new(false),
        }
    }

    /// Substitutes the command runner used by validators.
    pub fn with_command_runner(mut self, commands: Arc<dyn CommandRunner>) -> Self {
        self.commands = commands;
        self
    }

    /// Substitutes the external-state probe.
    pub fn with_state_probe(mut self, probe: Arc<dyn StateProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Load-time validation: definition structure, registry structure, and
    /// entry-step resolution for the declared completion type.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.definition.validate()?;
        self.registry.validate()?;
        let completion_type = self.definition.behavior.completion.type_name();
        self.registry.entry_step_for(completion_type)?;
        Ok(())
    }

    /// Drives the run. Guaranteed to return; never panics or propagates
    /// expected failures. A second call on the same runner is rejected.
    pub async fn run(&self, ctx: RunContext) -> AgentResult {
        if self.started.swap(true, Ordering::SeqCst) {
            return AgentResult::failed(RunError::AlreadyStarted.to_string(), Vec::new());
        }
        if let Err(e) = self.validate() {
            return AgentResult::failed(e.to_string(), Vec::new());
        }

        let worktree = match self.setup_worktree(&ctx).await {
            Ok(worktree) => worktree,
            Err(e) => return AgentResult::failed(e.to_string(), Vec::new()),
        };
        let run_cwd = worktree
            .as_ref()
            .map(|w| w.path.clone())
            .unwrap_or_else(|| ctx.cwd.clone());

        let mut summaries = Vec::new();
        let outcome = self.run_loop(&ctx, &run_cwd, &mut summaries).await;

        let (mut result, succeeded) = match outcome {
            Ok(reason) => (AgentResult::succeeded(reason, summaries), true),
            Err(e) => (AgentResult::failed(e.to_string(), summaries), false),
        };

        if let Some(worktree) = worktree {
            if let Err(note) = worktree.unwind(succeeded).await {
                result.reason = format!("{}; {note}", result.reason);
            }
        }
        result
    }

    async fn setup_worktree(
        &self,
        ctx: &RunContext,
    ) -> Result<Option<WorktreeSession>, ConfigError> {
        let Some(spec) = &self.definition.worktree else {
            return Ok(None);
        };
        if !spec.enabled {
            return Ok(None);
        }
        let branch = self.config.branch.clone().unwrap_or_else(|| {
            match self.config.issue {
                Some(issue) => format!("agent/{}-issue-{issue}", self.definition.name),
                None => format!("agent/{}", self.definition.name),
            }
        });
        let base_branch = self.config.base_branch.clone().ok_or_else(|| {
            ConfigError::InvalidDefinition(
                "worktree runs require an explicit base branch".to_string(),
            )
        })?;
        let root = spec
            .root
            .clone()
            .unwrap_or_else(|| ctx.cwd.join(".worktrees"));
        WorktreeSession::setup(&ctx.cwd, &root, &branch, &base_branch)
            .await
            .map(Some)
    }

    async fn run_loop(
        &self,
        ctx: &RunContext,
        cwd: &Path,
        summaries: &mut Vec<IterationSummary>,
    ) -> Result<String, RunError> {
        let behavior = &self.definition.behavior;
        let completion = behavior.completion.clone();
        let completion_type = completion.type_name();

        let logger = Arc::new(self.open_logger(cwd));
        let mut flow = FlowController::new(
            self.registry.clone(),
            completion_type,
            self.config.step_loop_limit(),
        )?;

        let prompt_base = resolve_rel(cwd, &self.definition.prompts.base_dir);
        let prompt_resolver = Arc::new(PromptResolver::new(prompt_base));
        let registry_path = resolve_rel(cwd, &self.definition.prompts.registry);
        let schema_root = registry_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf());

        let probe: Arc<dyn StateProbe> = match &self.probe {
            Some(probe) => probe.clone(),
            None => Arc::new(CliStateProbe {
                cwd: cwd.to_path_buf(),
            }),
        };
        let engine = ValidatorEngine::new(
            self.commands.clone(),
            probe,
            schema_root.clone(),
            cwd.to_path_buf(),
            ctx.cancellation.clone(),
        );
        let closer = Closer::new(
            completion.clone(),
            prompt_resolver.clone(),
            engine,
            schema_root,
        );
        let executor = IterationExecutor::new(
            self.bridge.clone(),
            behavior.allowed_tools.clone(),
            self.config.permission_mode.or(behavior.permission_mode),
            Some(cwd.to_path_buf()),
            ctx.cancellation.clone(),
            logger.clone(),
        );

        let system_prompt = behavior
            .system_prompt_path
            .as_ref()
            .and_then(|path| std::fs::read_to_string(resolve_rel(cwd, path)).ok());

        let mut ledger = RetryLedger::new();
        let mut pending_retry: Option<String> = None;
        let mut session_id = if self.config.resume() {
            self.config.session_id.clone()
        } else {
            None
        };
        let mut finalizing = false;
        let mut exhausted_notes: Vec<String> = Vec::new();

        info!(
            target: "agent_harness::runner",
            "starting {} ({completion_type})", self.definition.name
        );

        loop {
            if ctx.cancellation.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            let step_id = flow.start_iteration();
            let iteration = flow.iteration();
            if let Some(ceiling) = self.config.iterate_max {
                if iteration > ceiling {
                    return Err(RunError::IterationCeiling(ceiling));
                }
            }
            let step = self.registry.require(&step_id, "main loop")?.clone();
            ledger.enter_step(&step_id);

            let is_retry = pending_retry.is_some();
            let prompt = match pending_retry.take() {
                Some(prompt) => prompt,
                None => {
                    let uv = flow.uv_for(&step.input_spec)?;
                    let resolved = prompt_resolver.resolve(&step, &PromptVars::from_uv(uv))?;
                    for warning in &resolved.warnings {
                        warn!(target: "agent_harness::runner", "{warning}");
                        logger.warn(warning.clone(), json!({"step": step_id}));
                    }
                    resolved.text
                }
            };

            // One round-trip, with bounded backoff on retryable transport
            // failures; the session is resumed, not restarted.
            let mut transport_attempt = 0u32;
            let outcome = loop {
                transport_attempt += 1;
                let outcome = executor
                    .execute(IterationRequest {
                        iteration,
                        step_id: step_id.clone(),
                        prompt: prompt.clone(),
                        system_prompt: system_prompt.clone(),
                        session_id: session_id.clone(),
                    })
                    .await;

                let cancelled = ctx.cancellation.is_cancelled()
                    || outcome.summary.errors.iter().any(|e| {
                        matches!(
                            e.kind,
                            IterationErrorKind::Stream(StreamErrorKind::Cancelled)
                        )
                    });
                if cancelled {
                    summaries.push(outcome.summary);
                    return Err(RunError::Cancelled);
                }

                if outcome.summary.errors.iter().any(|e| {
                    matches!(
                        e.kind,
                        IterationErrorKind::Stream(StreamErrorKind::SessionExpired)
                    )
                }) {
                    // Expired sessions start fresh at the next query.
                    session_id = None;
                    break outcome;
                }

                let retryable = outcome.summary.errors.iter().find_map(|e| match &e.kind {
                    IterationErrorKind::Stream(kind) if kind.is_retryable() => Some(kind.clone()),
                    _ => None,
                });
                match retryable {
                    Some(kind) if transport_attempt < TRANSPORT_ATTEMPTS => {
                        let delay = kind.retry_delay(transport_attempt);
                        warn!(
                            target: "agent_harness::runner",
                            "transport failure ({kind:?}); backing off {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    _ => break outcome,
                }
            };
            session_id = outcome.session_id.clone();
            let mut summary = outcome.summary;

            // Format validation.
            if let Some(check) = &step.check {
                if let Err(violation) = validate_format(&check.response_format, &summary) {
                    let message = if violation.details.is_empty() {
                        violation.summary.clone()
                    } else {
                        format!("{}: {}", violation.summary, violation.details.join("; "))
                    };
                    summary.errors.push(IterationError {
                        kind: IterationErrorKind::FormatValidation,
                        message,
                    });
                    match ledger.note_format_failure(check.on_fail.max_retries) {
                        RetryDecision::Retry { attempt } => {
                            warn!(
                                target: "agent_harness::runner",
                                "format check failed at {step_id}, retry {attempt}"
                            );
                            pending_retry = Some(resolver::format_retry_prompt(&violation));
                        }
                        RetryDecision::Exhausted => {
                            warn!(
                                target: "agent_harness::runner",
                                "format retries exhausted at {step_id}"
                            );
                            exhausted_notes.push(format!("format retries exhausted at {step_id}"));
                        }
                    }
                }
            }

            // Gate interpretation: handoff capture, then routing.
            let mut route = None;
            if let Some(gate) = &step.structured_gate {
                if let Some(output) = summary.structured_output.clone() {
                    flow.record_output(&step_id, gate, &output);
                }
                let interpreted = flow.route_from(&step_id, summary.structured_output.as_ref())?;
                if interpreted.intent == Intent::Abort {
                    summaries.push(summary);
                    return Err(RunError::Aborted(step_id));
                }
                route = Some(interpreted);
            }

            let declared = finalizing
                || Closer::declares_completion(summary.structured_output.as_ref())
                || route.as_ref().is_some_and(|r| r.signal_completion);

            let assessment = closer
                .assess(&step, &summary, iteration, declared, &mut ledger)
                .await;
            summaries.push(summary);

            match assessment {
                Assessment::Complete { reason } => {
                    // A routed completion step runs once before the end.
                    if !finalizing {
                        if let Some(route) = &route {
                            if route.signal_completion {
                                if let Some(target) = &route.target {
                                    if target != &step_id {
                                        finalizing = true;
                                        flow.apply_route(route, is_retry)?;
                                        continue;
                                    }
                                }
                            }
                        }
                    }
                    let reason = if exhausted_notes.is_empty() {
                        reason
                    } else {
                        format!("{reason} ({})", exhausted_notes.join("; "))
                    };
                    logger.result(&reason, json!({"iterations": iteration}));
                    return Ok(reason);
                }
                Assessment::Retry { prompt, pattern } => {
                    logger.warn(
                        format!("completion verification failed ({pattern})"),
                        json!({"step": step_id}),
                    );
                    pending_retry = Some(prompt);
                }
                Assessment::Exhausted { pattern, attempts } => {
                    if closer.can_self_terminate() {
                        exhausted_notes.push(format!(
                            "completion verification exhausted at {step_id} ({pattern})"
                        ));
                    } else {
                        return Err(RunError::ConditionRetriesExhausted {
                            step_id,
                            attempts,
                            pattern,
                        });
                    }
                }
                Assessment::Continue => {}
            }

            // Next-step bookkeeping: a pending retry re-runs the same step
            // and stays out of the loop guard.
            if pending_retry.is_some() {
                flow.stay_on(&step_id);
            } else if let Some(route) = &route {
                flow.apply_route(route, is_retry)?;
            }
        }
    }

    fn open_logger(&self, cwd: &Path) -> JsonlLogger {
        let Some(dir) = &self.config.log_dir else {
            return JsonlLogger::disabled();
        };
        let dir = resolve_rel(cwd, dir);
        let run_name = format!(
            "{}-{}",
            self.definition.name,
            logging::current_timestamp_ms()
        );
        match JsonlLogger::create(&dir, &run_name) {
            Ok(logger) => logger,
            Err(e) => {
                warn!(
                    target: "agent_harness::runner",
                    "log directory unusable ({e}); logging disabled"
                );
                JsonlLogger::disabled()
            }
        }
    }
}

fn resolve_rel(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ScriptedBridge;
    use serde_json::json;

    fn minimal_definition() -> AgentDefinition {
        AgentDefinition::from_str(
            &json!({
                "name": "tester",
                "behavior": {
                    "completionType": "iterationBudget",
                    "completionConfig": {"maxIterations": 1}
                },
                "prompts": {"registry": "steps.json", "baseDir": "prompts"}
            })
            .to_string(),
            "test",
        )
        .unwrap()
    }

    fn minimal_registry() -> StepRegistry {
        StepRegistry::from_str(
            &json!({
                "entryStep": "work.task",
                "steps": {
                    "work.task": {"c2": "work", "c3": "task", "fallbackKey": "work"}
                }
            })
            .to_string(),
            "test",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let runner = Runner::new(
            minimal_definition(),
            minimal_registry(),
            RunConfig::default(),
            Arc::new(ScriptedBridge::new().with_text_turn("ok", "s1")),
        );
        let first = runner.run(RunContext::new(".")).await;
        assert!(first.success, "first run completes: {}", first.reason);

        let second = runner.run(RunContext::new(".")).await;
        assert!(!second.success);
        assert!(second.reason.contains("already started"));
    }

    #[tokio::test]
    async fn test_cancellation_before_start_fails_cleanly() {
        let runner = Runner::new(
            minimal_definition(),
            minimal_registry(),
            RunConfig::default(),
            Arc::new(ScriptedBridge::new()),
        );
        let ctx = RunContext::new(".");
        ctx.cancellation.cancel();
        let result = runner.run(ctx).await;
        assert!(!result.success);
        assert_eq!(result.reason, "cancelled");
        assert_eq!(result.iterations, 0);
    }

    #[tokio::test]
    async fn test_iteration_ceiling_fails_the_run() {
        let mut definition = minimal_definition();
        // A keyword that never appears, bounded by the ceiling.
        definition.behavior.completion = crate::definition::CompletionSpec::KeywordSignal {
            completion_keyword: "NEVER".to_string(),
            case_sensitive: true,
        };
        let bridge = ScriptedBridge::new()
            .with_text_turn("working", "s1")
            .with_text_turn("still working", "s1");
        let config = RunConfig {
            iterate_max: Some(2),
            ..RunConfig::default()
        };
        let runner = Runner::new(definition, minimal_registry(), config, Arc::new(bridge));
        let result = runner.run(RunContext::new(".")).await;
        assert!(!result.success);
        assert!(result.reason.contains("iteration ceiling"));
        assert_eq!(result.iterations, 2);
    }
}
