//! Layered run configuration.
//!
//! A run's effective configuration is assembled from four layers, later
//! layers winning field by field:
//!
//! 1. engine defaults (all fields unset),
//! 2. values carried by the agent definition,
//! 3. runtime overrides supplied by the embedding program,
//! 4. CLI flags.
//!
//! The merged value is frozen before the loop begins. Required values
//! (e.g. an iteration budget) are never invented here; they must arrive
//! through one of the layers.

use crate::definition::{AgentDefinition, PermissionMode};
use crate::flow::STEP_LOOP_LIMIT;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One configuration layer. Every field is optional so layers can be
/// overlaid; [`RunConfig::layered`] produces the frozen result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunConfig {
    /// Hard ceiling on loop iterations for completion types that cannot
    /// bound themselves. `None` imposes no ceiling.
    pub iterate_max: Option<u32>,
    pub issue: Option<u64>,
    pub project: Option<u64>,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    pub labels: Vec<String>,
    /// Resume the given SDK session instead of starting fresh.
    pub resume: Option<bool>,
    /// Session id to resume; supplied by the embedding collaborator, the
    /// engine persists none itself.
    pub session_id: Option<String>,
    /// Whether `--resume` also reloads prior iteration summaries. Off by
    /// default: resuming only reuses the SDK session id.
    pub resume_reload_summaries: Option<bool>,
    pub step_loop_limit: Option<u32>,
    pub log_dir: Option<PathBuf>,
}

impl RunConfig {
    /// Overlays `other` on top of `self`: set fields in `other` win.
    pub fn overlay(mut self, other: &RunConfig) -> RunConfig {
        if other.iterate_max.is_some() {
            self.iterate_max = other.iterate_max;
        }
        if other.issue.is_some() {
            self.issue = other.issue;
        }
        if other.project.is_some() {
            self.project = other.project;
        }
        if other.branch.is_some() {
            self.branch = other.branch.clone();
        }
        if other.base_branch.is_some() {
            self.base_branch = other.base_branch.clone();
        }
        if other.permission_mode.is_some() {
            self.permission_mode = other.permission_mode;
        }
        if !other.labels.is_empty() {
            self.labels = other.labels.clone();
        }
        if other.resume.is_some() {
            self.resume = other.resume;
        }
        if other.session_id.is_some() {
            self.session_id = other.session_id.clone();
        }
        if other.resume_reload_summaries.is_some() {
            self.resume_reload_summaries = other.resume_reload_summaries;
        }
        if other.step_loop_limit.is_some() {
            self.step_loop_limit = other.step_loop_limit;
        }
        if other.log_dir.is_some() {
            self.log_dir = other.log_dir.clone();
        }
        self
    }

    /// Merges layers in precedence order: defaults < definition < runtime <
    /// CLI. Later layers win.
    pub fn layered(layers: &[RunConfig]) -> RunConfig {
        layers
            .iter()
            .fold(RunConfig::default(), |merged, layer| merged.overlay(layer))
    }

    /// The layer an agent definition contributes.
    pub fn from_definition(definition: &AgentDefinition) -> RunConfig {
        RunConfig {
            permission_mode: definition.behavior.permission_mode,
            log_dir: definition
                .logging
                .as_ref()
                .map(|logging| logging.directory.clone()),
            ..RunConfig::default()
        }
    }

    pub fn resume(&self) -> bool {
        self.resume.unwrap_or(false)
    }

    pub fn resume_reload_summaries(&self) -> bool {
        self.resume_reload_summaries.unwrap_or(false)
    }

    pub fn step_loop_limit(&self) -> u32 {
        self.step_loop_limit.unwrap_or(STEP_LOOP_LIMIT)
    }
}
