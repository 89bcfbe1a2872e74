//! `agent-harness` - an autonomous agent runtime.
//!
//! Given a declarative agent definition plus a step registry, the harness
//! drives an external LLM backend through a multi-iteration loop until a
//! well-defined completion criterion is verified. "Do this task until it is
//! really done" becomes a disciplined sequence of prompt assembly, LLM
//! query, structured-output interpretation, external-state validation, and
//! conditional retry.
//!
//! # Architecture
//!
//! - [`runner::Runner`] owns one run end-to-end and drives the loop.
//! - [`flow::FlowController`] picks the next step by interpreting each
//!   iteration's structured output through its declared gate.
//! - [`closer::Closer`] gates termination: the completion strategy plus a
//!   verification sub-loop for AI-declared completions.
//! - [`executor::IterationExecutor`] performs exactly one LLM round-trip
//!   against an [`bridge::SdkBridge`].
//! - [`resolver::PromptResolver`] turns step ids and variables into final
//!   prompt strings via categorical paths with fallbacks.
//! - [`context::StepContext`] namespaces step outputs so one step's results
//!   can feed the next, with no implicit sharing.
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_harness::{
//!     AgentDefinition, ClaudeCliBridge, RunConfig, RunContext, Runner, StepRegistry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let definition = AgentDefinition::from_path("agents/iterator.json".as_ref()).unwrap();
//!     let registry = StepRegistry::from_path("prompts/steps.json".as_ref()).unwrap();
//!
//!     let runner = Runner::new(
//!         definition,
//!         registry,
//!         RunConfig::default(),
//!         Arc::new(ClaudeCliBridge::new()),
//!     );
//!     let result = runner.run(RunContext::new(".")).await;
//!     println!("{}", result.render_summary());
//! }
//! ```

pub mod bridge;
pub mod cli;
pub mod closer;
pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod executor;
pub mod extract;
pub mod flow;
pub mod format;
pub mod logging;
pub mod registry;
pub mod resolver;
pub mod runner;
pub mod schema;
pub mod summary;
pub mod worktree;

pub use bridge::{ClaudeCliBridge, ScriptedBridge, SdkBridge};
pub use closer::{Assessment, Closer};
pub use config::RunConfig;
pub use context::StepContext;
pub use definition::{AgentDefinition, CompletionSpec, PermissionMode};
pub use error::{ConfigError, RunError};
pub use flow::FlowController;
pub use registry::{Intent, StepRegistry};
pub use resolver::PromptResolver;
pub use runner::{RunContext, Runner};
pub use summary::{AgentResult, IterationSummary};
