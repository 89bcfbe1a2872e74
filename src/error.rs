//! Error types for the harness engine.
//!
//! The taxonomy separates configuration problems, which reject a run before
//! the first iteration, from runtime failures, which the runner translates
//! into an [`AgentResult`](crate::summary::AgentResult) with `success = false`.
//! Transport failures never surface here: the iteration executor captures
//! them inside the iteration summary (see [`crate::bridge`]).

use thiserror::Error;

/// Load-time configuration problems. Not recoverable: the run is rejected
/// before the loop begins, and the process exits with code 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A definition or registry file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A definition or registry file could not be parsed.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Neither `entryStepMapping[completionType]` nor `entryStep` is present.
    #[error(
        "no entry step: neither entryStepMapping[{completion_type}] nor entryStep is declared"
    )]
    MissingEntryStep { completion_type: String },

    /// Steps that appear in a flow but lack a gate or transitions. The
    /// message names every offending step.
    #[error("structuredGate and transitions required for flow steps: {}", step_ids.join(", "))]
    GatelessFlowSteps { step_ids: Vec<String> },

    /// A gate that declares no fallback intent cannot interpret malformed
    /// output.
    #[error("structuredGate for {step_id} declares no fallbackIntent")]
    MissingFallbackIntent { step_id: String },

    /// A transition routes to a step id absent from the registry.
    #[error("transition target {target} (from {step_id}) does not exist in the registry")]
    UnknownTransitionTarget { step_id: String, target: String },

    /// A step id referenced outside of transitions (entry, flow,
    /// completionSteps) does not exist.
    #[error("step {step_id} referenced by {referrer} does not exist in the registry")]
    UnknownStep { step_id: String, referrer: String },

    /// `maxIterations` must be a positive integer.
    #[error("maxIterations must be a positive integer (got {0})")]
    InvalidIterationBudget(u64),

    /// An empty completion keyword would match every response.
    #[error("completionKeyword must not be empty")]
    EmptyCompletionKeyword,

    /// A composite completion with no conditions can never be evaluated.
    #[error("composite completion requires at least one condition")]
    EmptyComposite,

    /// Two runs may not share a branch: 1 issue = 1 branch = 1 worktree =
    /// 1 agent instance.
    #[error("branch {branch} already has an active worktree at {path}")]
    WorktreeHeld { branch: String, path: String },

    /// Any other structural problem with the agent definition.
    #[error("invalid agent definition: {0}")]
    InvalidDefinition(String),
}

/// Runtime failures surfaced by the engine. The runner translates every
/// variant into a failed [`AgentResult`](crate::summary::AgentResult) and
/// returns cleanly; none of these escape `Runner::run`.
#[derive(Debug, Error)]
pub enum RunError {
    /// Configuration problems discovered after start (e.g. a routed step
    /// vanished between load and run; precluded by the loader, kept as a
    /// defensive surface).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The step-loop guard tripped: the same step was the routed target too
    /// many times without progress.
    #[error("step {step_id} was the routed target {count} consecutive times (limit {limit})")]
    StepLoop {
        step_id: String,
        count: u32,
        limit: u32,
    },

    /// The iteration ceiling was reached without completion.
    #[error("iteration ceiling of {0} reached without completion")]
    IterationCeiling(u32),

    /// The run was cancelled from outside.
    #[error("cancelled")]
    Cancelled,

    /// No prompt source exists for a step: file, fallback and generic
    /// template are all absent.
    #[error("no prompt source for step {step_id}")]
    Resolution { step_id: String },

    /// An input spec entry was required but the referenced step output is
    /// missing and no default was declared.
    #[error("missing required input {name} (from {from})")]
    MissingRequiredInput { name: String, from: String },

    /// Completion-condition retries were exhausted and the completion type
    /// offers no other path to finish.
    #[error(
        "completion conditions for step {step_id} stayed invalid after {attempts} attempts (last pattern: {pattern})"
    )]
    ConditionRetriesExhausted {
        step_id: String,
        attempts: u32,
        pattern: String,
    },

    /// The agent routed an `abort` intent.
    #[error("aborted by agent at step {0}")]
    Aborted(String),

    /// `run` was called twice on the same runner.
    #[error("run already started on this runner")]
    AlreadyStarted,

    /// Wrapper for unexpected internal failures; the runner turns the
    /// message into the failure reason.
    #[error("{0}")]
    Internal(String),
}

impl RunError {
    /// Process exit code for this failure: configuration errors exit with 2,
    /// everything else with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Config(_) => 2,
            _ => 1,
        }
    }
}
