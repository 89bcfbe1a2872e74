//! CLI option surface.
//!
//! Parsing lives in thin collaborators; this module defines the options the
//! engine consumes and the exit-code contract: 0 on success, 1 on any
//! failed run, 2 on a configuration error at start.

use crate::config::RunConfig;
use crate::definition::PermissionMode;
use crate::summary::AgentResult;
use clap::Parser;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;

/// Run one agent until its completion criterion is verified.
#[derive(Debug, Parser)]
#[command(name = "harness", version, about)]
pub struct HarnessCli {
    /// Name of the agent definition to run.
    pub agent: String,

    /// Issue number the run is bound to.
    #[arg(long)]
    pub issue: Option<u64>,

    /// Project board number.
    #[arg(long)]
    pub project: Option<u64>,

    /// Hard ceiling on loop iterations.
    #[arg(long = "iterate-max")]
    pub iterate_max: Option<u32>,

    /// Branch to work on (derived from the agent and issue otherwise).
    #[arg(long)]
    pub branch: Option<String>,

    /// Base branch for worktree setup and merge-back.
    #[arg(long = "base-branch")]
    pub base_branch: Option<String>,

    /// Resume the previous SDK session instead of starting fresh.
    #[arg(long)]
    pub resume: bool,

    /// Permission mode forwarded to the backend.
    #[arg(long = "permission-mode")]
    pub permission_mode: Option<PermissionMode>,

    /// Label(s) applied by GitHub collaborators; repeatable.
    #[arg(long = "label")]
    pub labels: Vec<String>,
}

impl HarnessCli {
    /// The configuration layer these flags contribute (the highest-
    /// precedence layer of the merge).
    pub fn overlay(&self) -> RunConfig {
        RunConfig {
            iterate_max: self.iterate_max,
            issue: self.issue,
            project: self.project,
            branch: self.branch.clone(),
            base_branch: self.base_branch.clone(),
            permission_mode: self.permission_mode,
            labels: self.labels.clone(),
            resume: if self.resume { Some(true) } else { None },
            ..RunConfig::default()
        }
    }
}

/// Exit code for a finished run.
pub fn exit_code(result: &AgentResult) -> i32 {
    if result.success {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    }
}
