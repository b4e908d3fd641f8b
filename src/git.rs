//! Git operations for the run: worker worktrees, per-level staging
//! merges, and base-branch promotion.
//!
//! Every worker gets its own branch checked out in its own worktree, all
//! cut from the integration base. At a level barrier the coordinator
//! merges worker branches into a staging branch here, and on success
//! promotes the base to the staging tip. All operations rediscover the
//! repository per call; `GitOps` itself is cheap to clone around.

use std::path::{Path, PathBuf};

use git2::{ErrorCode, IndexAddOption, MergeOptions, Repository, ResetType, Signature};

use crate::{mlog_debug, mlog_warn, Result};

/// Outcome of merging one source branch into a target branch.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// Target already contains the source.
    UpToDate,
    /// Target moved forward to the source tip without a merge commit.
    FastForward(String),
    /// A true merge commit was created.
    Merged(String),
    /// Conflicting paths; the target branch was left untouched.
    Conflicted(Vec<String>),
}

impl MergeOutcome {
    pub fn is_clean(&self) -> bool {
        !matches!(self, Self::Conflicted(_))
    }

    /// The resulting tip commit, when the merge was clean and moved the
    /// target.
    pub fn commit(&self) -> Option<&str> {
        match self {
            Self::FastForward(id) | Self::Merged(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    /// # Errors
    /// Fails if `repo_path` is not inside a git repository.
    pub fn new(repo_path: &Path) -> Result<Self> {
        mlog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("Maestro", "maestro@localhost"))?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Name of the currently checked out branch, or a short commit id on a
    /// detached HEAD.
    pub fn current_branch(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                return Ok(name.to_string());
            }
        }
        let commit = head.peel_to_commit()?;
        Ok(format!("{:.7}", commit.id()))
    }

    /// Tip commit id of a local branch.
    pub fn branch_commit(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let branch = repo.find_branch(branch, git2::BranchType::Local)?;
        let commit = branch.into_reference().peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let found = repo.find_branch(branch, git2::BranchType::Local);
        match found {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create (or forcibly move) a local branch at the tip of `from`.
    pub fn create_branch(&self, name: &str, from: &str, force: bool) -> Result<()> {
        mlog_debug!("GitOps::create_branch name={} from={}", name, from);
        let repo = self.repo()?;
        let commit = repo
            .find_branch(from, git2::BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        repo.branch(name, &commit, force)?;
        Ok(())
    }

    /// Check out a local branch in the primary working directory.
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        mlog_debug!("GitOps::checkout_branch branch={}", branch);
        let repo = self.repo()?;
        let reference = repo
            .find_branch(branch, git2::BranchType::Local)?
            .into_reference();
        let commit = reference.peel_to_commit()?;
        repo.checkout_tree(
            commit.as_object(),
            Some(git2::build::CheckoutBuilder::default().force()),
        )?;
        let refname = reference
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("refs/heads/{branch}"));
        repo.set_head(&refname)?;
        Ok(())
    }

    /// Create a worker branch at the tip of `from` and check it out in a
    /// new worktree at `worktree_path`.
    pub fn create_worktree(&self, branch: &str, worktree_path: &Path, from: &str) -> Result<()> {
        mlog_debug!(
            "GitOps::create_worktree branch={} from={} path={}",
            branch,
            from,
            worktree_path.display()
        );
        let repo = self.repo()?;
        let base_commit = repo
            .find_branch(from, git2::BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let branch_ref = repo.branch(branch, &base_commit, false)?.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Worktree names come from the folder, since branch names carry
        // slashes.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Re-attach an existing branch to a fresh worktree directory. Used on
    /// resume when a worker's worktree vanished but its branch survived.
    /// Stale admin entries for the old directory are pruned first, since
    /// git refuses to check out a branch it still thinks is checked out.
    pub fn attach_worktree(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        mlog_debug!(
            "GitOps::attach_worktree branch={} path={}",
            branch,
            worktree_path.display()
        );
        self.prune_worktrees()?;
        let repo = self.repo()?;
        let branch_ref = repo
            .find_branch(branch, git2::BranchType::Local)?
            .into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Remove a worktree and every trace of it. The admin directory under
    /// `.git/worktrees/` must go too, or git keeps treating the branch as
    /// checked out.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        mlog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let by_path: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
            })
            .map(String::from);
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);
        let worktree_name = by_path.or_else(|| {
            folder_name.as_ref().and_then(|fname| {
                worktrees
                    .iter()
                    .flatten()
                    .find(|name| *name == fname.as_str())
                    .map(String::from)
            })
        });

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    mlog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        if let Some(ref name) = worktree_name {
            self.cleanup_worktree_admin_dir(name);
        }
        if let Some(ref fname) = folder_name {
            self.cleanup_worktree_admin_dir(fname);
        }

        Ok(())
    }

    fn cleanup_worktree_admin_dir(&self, worktree_name: &str) {
        if let Ok(repo) = self.repo() {
            let admin_dir = repo.path().join("worktrees").join(worktree_name);
            if admin_dir.exists() {
                mlog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
    }

    /// Prune administrative state for worktrees whose directories are gone.
    pub fn prune_worktrees(&self) -> Result<()> {
        let repo = self.repo()?;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(worktree) = repo.find_worktree(name) {
                if !worktree.path().exists() {
                    let _ = worktree.prune(Some(
                        git2::WorktreePruneOptions::new()
                            .valid(true)
                            .working_tree(true)
                            .locked(true),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Stage everything in a worktree and commit. Returns the new commit
    /// id.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<String> {
        mlog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(commit_id.to_string())
    }

    /// Merge `source` into `target`, checking `target` out in the primary
    /// working directory first. On conflict the merge is aborted, `target`
    /// is restored, and the conflicting paths are reported.
    pub fn merge_branch(&self, target: &str, source: &str) -> Result<MergeOutcome> {
        mlog_debug!("GitOps::merge_branch target={} source={}", target, source);
        let repo = self.repo()?;

        let target_ref = repo
            .find_branch(target, git2::BranchType::Local)?
            .into_reference();
        let target_commit = target_ref.peel_to_commit()?;
        repo.checkout_tree(
            target_commit.as_object(),
            Some(git2::build::CheckoutBuilder::default().force()),
        )?;
        let target_refname = target_ref
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("refs/heads/{target}"));
        repo.set_head(&target_refname)?;

        let source_commit = repo
            .find_branch(source, git2::BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let source_annotated = repo.find_annotated_commit(source_commit.id())?;

        let (analysis, _preference) = repo.merge_analysis(&[&source_annotated])?;

        if analysis.is_up_to_date() {
            return Ok(MergeOutcome::UpToDate);
        }

        if analysis.is_fast_forward() {
            repo.reference(
                &target_refname,
                source_commit.id(),
                true,
                &format!("Fast-forward {target} to {source}"),
            )?;
            repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
            return Ok(MergeOutcome::FastForward(source_commit.id().to_string()));
        }

        let mut merge_opts = MergeOptions::new();
        repo.merge(&[&source_annotated], Some(&mut merge_opts), None)?;

        let index = repo.index()?;
        if index.has_conflicts() {
            let files = Self::conflicting_paths(&repo)?;
            let _ = repo.cleanup_state();
            // Drop the half-merged index and tree; target stays where it
            // was.
            repo.reset(target_commit.as_object(), ResetType::Hard, None)?;
            return Ok(MergeOutcome::Conflicted(files));
        }

        let sig = Self::signature(&repo)?;
        let mut index = repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let message = format!("Merge {source} into {target}");
        let commit_id = repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &message,
            &tree,
            &[&target_commit, &source_commit],
        )?;
        repo.cleanup_state()?;

        Ok(MergeOutcome::Merged(commit_id.to_string()))
    }

    fn conflicting_paths(repo: &Repository) -> Result<Vec<String>> {
        let index = repo.index()?;
        let mut files = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let path = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref())
                .map(|e| String::from_utf8_lossy(&e.path).to_string())
                .unwrap_or_default();
            files.push(path);
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Move `branch` to `commit_id` and check it out in the primary
    /// working directory. Used to promote the integration base to a
    /// validated staging tip.
    pub fn promote_branch(&self, branch: &str, commit_id: &str) -> Result<()> {
        mlog_debug!(
            "GitOps::promote_branch branch={} commit={}",
            branch,
            commit_id
        );
        let repo = self.repo()?;
        let oid = git2::Oid::from_str(commit_id)?;
        let refname = format!("refs/heads/{branch}");
        repo.reference(&refname, oid, true, &format!("Promote {branch}"))?;
        repo.set_head(&refname)?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
        Ok(())
    }

    /// Hard-reset a worktree (and the branch checked out in it) to a
    /// commit. The worktree shares the repository's object database, so
    /// any commit reachable from the primary repo works.
    pub fn reset_worktree_to(&self, worktree_path: &Path, commit_id: &str) -> Result<()> {
        mlog_debug!(
            "GitOps::reset_worktree_to path={} commit={}",
            worktree_path.display(),
            commit_id
        );
        let repo = Repository::open(worktree_path)?;
        let oid = git2::Oid::from_str(commit_id)?;
        let commit = repo.find_commit(oid)?;
        repo.reset(commit.as_object(), ResetType::Hard, None)?;
        Ok(())
    }

    /// Delete a local branch. Missing branches are fine; other failures
    /// log a warning instead of erroring, since the branch may be checked
    /// out elsewhere.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        mlog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    mlog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => {
                mlog_warn!("Error looking up branch '{}': {}", branch, e);
            }
        }
        Ok(())
    }

    /// Whether a worktree has uncommitted changes, staged or not.
    pub fn is_dirty(&self, worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let statuses = repo.statuses(None)?;
        Ok(!statuses.is_empty())
    }
}
