//! Git worktree lifecycle around a run.
//!
//! One issue = one branch = one worktree = one agent instance. Setup
//! rejects a branch that is already checked out in another worktree;
//! unwinding after a successful run merges the branch back using the first
//! strategy that succeeds (squash, fast-forward, merge) and removes the
//! worktree. A failed run, or a failed merge-back, leaves the worktree in
//! place so the work is not lost.

use crate::error::ConfigError;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Merge-back strategies tried in declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Squash,
    FastForward,
    Merge,
}

impl MergeStrategy {
    pub const DEFAULT_ORDER: [MergeStrategy; 3] = [
        MergeStrategy::Squash,
        MergeStrategy::FastForward,
        MergeStrategy::Merge,
    ];

    fn merge_args(&self, branch: &str) -> Vec<String> {
        match self {
            MergeStrategy::Squash => vec!["merge".into(), "--squash".into(), branch.into()],
            MergeStrategy::FastForward => {
                vec!["merge".into(), "--ff-only".into(), branch.into()]
            }
            MergeStrategy::Merge => vec!["merge".into(), "--no-edit".into(), branch.into()],
        }
    }

    fn label(&self) -> &'static str {
        match self {
            MergeStrategy::Squash => "squash",
            MergeStrategy::FastForward => "fast-forward",
            MergeStrategy::Merge => "merge",
        }
    }
}

/// An active worktree for one run.
#[derive(Debug)]
pub struct WorktreeSession {
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    repo_root: PathBuf,
}

impl WorktreeSession {
    /// Creates the worktree for `branch` under `root`, branching off
    /// `base_branch`. A branch already attached to a worktree rejects the
    /// run.
    pub async fn setup(
        repo_root: &Path,
        root: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<Self, ConfigError> {
        if let Some(existing) = branch_worktree(repo_root, branch).await {
            return Err(ConfigError::WorktreeHeld {
                branch: branch.to_string(),
                path: existing,
            });
        }

        let path = root.join(branch.replace('/', "-"));
        let path_str = path.display().to_string();

        // Reuse an existing branch, create it from the base otherwise.
        let reuse = git(repo_root, &["worktree", "add", &path_str, branch]).await;
        if !reuse.success {
            let create = git(
                repo_root,
                &["worktree", "add", &path_str, "-b", branch, base_branch],
            )
            .await;
            if !create.success {
                return Err(ConfigError::InvalidDefinition(format!(
                    "worktree setup failed for {branch}: {}",
                    create.stderr.trim()
                )));
            }
        }

        info!(
            target: "agent_harness::worktree",
            "worktree ready at {} on {branch}", path.display()
        );
        Ok(Self {
            path,
            branch: branch.to_string(),
            base_branch: base_branch.to_string(),
            repo_root: repo_root.to_path_buf(),
        })
    }

    /// Unwinds after the run. On success, tries each merge strategy in
    /// order and removes the worktree; on failure (of the run or of every
    /// strategy) the worktree stays in place and the returned message is
    /// surfaced in the run's reason.
    pub async fn unwind(self, run_succeeded: bool) -> Result<(), String> {
        if !run_succeeded {
            warn!(
                target: "agent_harness::worktree",
                "run failed; leaving worktree at {}", self.path.display()
            );
            return Err(format!(
                "worktree left in place at {}",
                self.path.display()
            ));
        }

        let checkout = git(&self.repo_root, &["checkout", &self.base_branch]).await;
        if !checkout.success {
            return Err(format!(
                "could not check out {}: {}; worktree left at {}",
                self.base_branch,
                checkout.stderr.trim(),
                self.path.display()
            ));
        }

        for strategy in MergeStrategy::DEFAULT_ORDER {
            let args: Vec<String> = strategy.merge_args(&self.branch);
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            let outcome = git(&self.repo_root, &arg_refs).await;
            if outcome.success {
                // A squash merge stages without committing.
                if strategy == MergeStrategy::Squash {
                    let commit = git(
                        &self.repo_root,
                        &["commit", "-m", &format!("merge {} (squash)", self.branch)],
                    )
                    .await;
                    if !commit.success {
                        debug!(
                            target: "agent_harness::worktree",
                            "squash commit failed: {}", commit.stderr.trim()
                        );
                        continue;
                    }
                }
                info!(
                    target: "agent_harness::worktree",
                    "merged {} back via {}", self.branch, strategy.label()
                );
                let path_str = self.path.display().to_string();
                let removed = git(&self.repo_root, &["worktree", "remove", &path_str]).await;
                if !removed.success {
                    return Err(format!(
                        "merged via {} but worktree removal failed: {}",
                        strategy.label(),
                        removed.stderr.trim()
                    ));
                }
                return Ok(());
            }
            // Undo a half-applied attempt before the next strategy.
            let _ = git(&self.repo_root, &["merge", "--abort"]).await;
            let _ = git(&self.repo_root, &["reset", "--merge"]).await;
        }

        Err(format!(
            "no merge strategy succeeded for {}; worktree left at {}",
            self.branch,
            self.path.display()
        ))
    }
}

struct GitOutcome {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn git(cwd: &Path, args: &[&str]) -> GitOutcome {
    match Command::new("git").args(args).current_dir(cwd).output().await {
        Ok(output) => GitOutcome {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Err(e) => GitOutcome {
            success: false,
            stdout: String::new(),
            stderr: e.to_string(),
        },
    }
}

/// Path of the worktree holding `branch`, if one exists.
async fn branch_worktree(repo_root: &Path, branch: &str) -> Option<String> {
    let outcome = git(repo_root, &["worktree", "list", "--porcelain"]).await;
    if !outcome.success {
        return None;
    }
    let needle = format!("branch refs/heads/{branch}");
    let mut current_path: Option<&str> = None;
    for line in outcome.stdout.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            current_path = Some(path);
        } else if line.trim() == needle {
            return current_path.map(str::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_strategy_order() {
        assert_eq!(
            MergeStrategy::DEFAULT_ORDER,
            [
                MergeStrategy::Squash,
                MergeStrategy::FastForward,
                MergeStrategy::Merge
            ]
        );
    }

    #[test]
    fn test_merge_args_per_strategy() {
        assert_eq!(
            MergeStrategy::Squash.merge_args("agent/issue-1"),
            vec!["merge", "--squash", "agent/issue-1"]
        );
        assert_eq!(
            MergeStrategy::FastForward.merge_args("b"),
            vec!["merge", "--ff-only", "b"]
        );
        assert_eq!(
            MergeStrategy::Merge.merge_args("b"),
            vec!["merge", "--no-edit", "b"]
        );
    }
}
