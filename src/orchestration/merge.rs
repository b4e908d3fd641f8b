//! Level-barrier merge coordination.
//!
//! When every task at a level has settled, worker branches are merged
//! into a throwaway staging branch, quality gates run against the staging
//! checkout, and only a fully validated staging tip is promoted to the
//! integration base. Any conflict or required-gate failure discards
//! staging and leaves the base untouched; conflicts are never resolved
//! automatically because they mean a file-ownership violation upstream.

use std::sync::Arc;

use crate::git::{GitOps, MergeOutcome};
use crate::orchestration::gates::{GateReport, GateRunner};
use crate::state::{LevelStatus, MergeStatus, StateStore, TaskStatus};
use crate::{mlog, mlog_warn, Result};

/// Outcome of one level merge attempt.
#[derive(Debug)]
pub enum LevelMerge {
    /// Staging validated and promoted; base now sits at `commit`.
    Promoted {
        commit: String,
        gates: Vec<GateReport>,
    },
    /// A worker branch conflicted with staging; nothing was promoted.
    Conflicted { branch: String, files: Vec<String> },
    /// A required gate failed; staging discarded, base untouched.
    GatesFailed { gates: Vec<GateReport> },
    /// Tasks at the level are neither complete nor blocked.
    Incomplete { unfinished: Vec<String> },
}

impl LevelMerge {
    pub fn is_promoted(&self) -> bool {
        matches!(self, Self::Promoted { .. })
    }
}

pub struct MergeCoordinator {
    git: GitOps,
    store: Arc<StateStore>,
    gates: GateRunner,
    base_branch: String,
}

impl MergeCoordinator {
    pub fn new(
        git: GitOps,
        store: Arc<StateStore>,
        gates: GateRunner,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            git,
            store,
            gates,
            base_branch: base_branch.into(),
        }
    }

    pub fn staging_branch(feature: &str, level: u32) -> String {
        format!("maestro/staging/{feature}-L{level}")
    }

    /// Run the merge protocol for `level`. Exactly one of the `LevelMerge`
    /// variants comes back; only `Promoted` moves the base branch.
    pub async fn merge_level(&self, level: u32) -> Result<LevelMerge> {
        let state = self.store.snapshot().await;

        let unfinished: Vec<String> = state
            .tasks_at_level(level)
            .filter(|t| !matches!(t.status, TaskStatus::Complete | TaskStatus::Blocked))
            .map(|t| t.id.clone())
            .collect();
        if !unfinished.is_empty() {
            mlog_warn!(
                "Level {} merge refused, unfinished tasks: {}",
                level,
                unfinished.join(", ")
            );
            return Ok(LevelMerge::Incomplete { unfinished });
        }

        let staging = Self::staging_branch(&state.feature, level);
        self.set_merge_status(level, MergeStatus::InProgress).await?;
        mlog!("Level {} merge started on {}", level, staging);

        // Force-create staging from the base; a leftover staging branch
        // from an aborted attempt gets clobbered.
        self.git.create_branch(&staging, &self.base_branch, true)?;

        let workers: Vec<(u32, String)> = state
            .workers
            .values()
            .map(|w| (w.worker_id, w.branch.clone()))
            .collect();

        for (worker_id, branch) in &workers {
            match self.git.merge_branch(&staging, branch)? {
                MergeOutcome::Conflicted(files) => {
                    mlog_warn!(
                        "Level {} merge conflict from worker {} ({}): {}",
                        level,
                        worker_id,
                        branch,
                        files.join(", ")
                    );
                    self.discard_staging(&staging)?;
                    self.set_merge_status(level, MergeStatus::Failed).await?;
                    return Ok(LevelMerge::Conflicted {
                        branch: branch.clone(),
                        files,
                    });
                }
                MergeOutcome::UpToDate => {
                    mlog!("Worker {} had no new work for level {}", worker_id, level)
                }
                outcome => {
                    if let Some(commit) = outcome.commit() {
                        mlog!("Merged worker {} into {} at {:.7}", worker_id, staging, commit);
                    }
                }
            }
        }

        let gates = self.gates.run_all(self.git.repo_path()).await;
        if gates.iter().any(GateReport::blocks_promotion) {
            self.discard_staging(&staging)?;
            self.set_merge_status(level, MergeStatus::Failed).await?;
            return Ok(LevelMerge::GatesFailed { gates });
        }

        let tip = self.git.branch_commit(&staging)?;
        self.git.promote_branch(&self.base_branch, &tip)?;
        self.git.delete_branch(&staging)?;
        for worker in state.workers.values() {
            if worker.worktree.exists() {
                self.git.reset_worktree_to(&worker.worktree, &tip)?;
            } else {
                mlog_warn!(
                    "Worker {} worktree missing, skipping reset: {}",
                    worker.worker_id,
                    worker.worktree.display()
                );
            }
        }

        self.store
            .mutate(|s| {
                if let Some(l) = s.level_mut(level) {
                    l.status = LevelStatus::Complete;
                    l.merge_status = MergeStatus::Complete;
                }
                Ok(())
            })
            .await?;

        mlog!("Level {} promoted to {} at {:.7}", level, self.base_branch, tip);
        Ok(LevelMerge::Promoted { commit: tip, gates })
    }

    /// Abandon staging: reattach the primary checkout to the base branch
    /// and drop the staging branch. The base ref was never moved.
    fn discard_staging(&self, staging: &str) -> Result<()> {
        self.git.checkout_branch(&self.base_branch)?;
        self.git.delete_branch(staging)?;
        Ok(())
    }

    async fn set_merge_status(&self, level: u32, status: MergeStatus) -> Result<()> {
        self.store
            .mutate(move |s| {
                if let Some(l) = s.level_mut(level) {
                    l.merge_status = status;
                }
                Ok(())
            })
            .await
    }
}
