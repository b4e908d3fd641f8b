//! Persisted data model for a feature run.
//!
//! Everything in this module serializes into the single JSON state document:
//! tasks, workers, levels, and the run aggregate itself. Status enums use
//! snake_case string encodings so the state file stays readable, and every
//! status change goes through a validated transition table - an illegal hop
//! is an error, never a silent write.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{FileSet, TaskGraph, TaskSpec, Verification};
use crate::{Error, Result};

/// Lifecycle of a task.
///
/// The happy path is `pending -> claimed -> in_progress -> verifying ->
/// complete`. Verification failure lands in `failed` (which is the only
/// transition that spends retry budget); supervisor-detected crashes go
/// through `worker_crash` back to `pending` without touching the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Verifying,
    Complete,
    Failed,
    WorkerCrash,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
            TaskStatus::WorkerCrash => "worker_crash",
            TaskStatus::Blocked => "blocked",
        }
    }

    /// Whether this status ends the polling barrier's interest in the task.
    /// `failed` is terminal here; whether it pauses the run depends on the
    /// remaining retry budget, which the claim layer evaluates.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Blocked
        )
    }

    /// Whether a worker currently owns the task.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Claimed | TaskStatus::InProgress | TaskStatus::Verifying
        )
    }

    /// The validated transition table. Orchestrator-driven edges
    /// (crash recovery, checkpoint release, blocking) are first-class here
    /// so no component ever needs an out-of-table hop.
    pub fn can_transition(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, Claimed)
                | (Claimed, InProgress)
                | (InProgress, Verifying)
                | (Verifying, Complete)
                | (Verifying, Failed)
                | (Failed, Pending)
                | (Claimed, WorkerCrash)
                | (InProgress, WorkerCrash)
                | (Verifying, WorkerCrash)
                | (WorkerCrash, Pending)
                | (Claimed, Pending)
                | (InProgress, Pending)
                | (Pending, Blocked)
                | (Blocked, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Running,
    Verifying,
    Checkpoint,
    Stopped,
    Crashed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Running => "running",
            WorkerStatus::Verifying => "verifying",
            WorkerStatus::Checkpoint => "checkpoint",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Crashed => "crashed",
        }
    }

    /// Statuses in which missed heartbeats count against the worker.
    pub fn expects_heartbeat(&self) -> bool {
        !matches!(self, WorkerStatus::Stopped | WorkerStatus::Crashed)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    Pending,
    Running,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

/// One task's persisted record: the `TaskSpec` fields it was loaded with
/// plus the runtime fields the engine mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub title: String,
    pub level: u32,
    pub dependencies: BTreeSet<String>,
    pub files: FileSet,
    pub verification: Verification,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub worker_id: Option<u32>,
    pub last_error: Option<String>,
    pub blocked_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskState {
    pub fn from_spec(spec: &TaskSpec) -> Self {
        Self {
            id: spec.id.clone(),
            title: spec.title.clone(),
            level: spec.level,
            dependencies: spec.dependencies.iter().cloned().collect(),
            files: spec.files.clone(),
            verification: spec.verification.clone(),
            status: TaskStatus::Pending,
            retry_count: 0,
            worker_id: None,
            last_error: None,
            blocked_reason: None,
            started_at: None,
            completed_at: None,
        }
    }

    fn set_status(&mut self, target: TaskStatus) -> Result<()> {
        if !self.status.can_transition(target) {
            return Err(Error::InvalidTaskTransition {
                task_id: self.id.clone(),
                from: self.status.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }
        self.status = target;
        Ok(())
    }

    /// `pending -> claimed`, recording the owning worker.
    pub fn claim(&mut self, worker_id: u32) -> Result<()> {
        self.set_status(TaskStatus::Claimed)?;
        self.worker_id = Some(worker_id);
        Ok(())
    }

    /// `claimed -> in_progress`.
    pub fn start(&mut self) -> Result<()> {
        self.set_status(TaskStatus::InProgress)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `in_progress -> verifying`.
    pub fn begin_verification(&mut self) -> Result<()> {
        self.set_status(TaskStatus::Verifying)
    }

    /// `verifying -> complete`. Releases the worker.
    pub fn complete(&mut self) -> Result<()> {
        self.set_status(TaskStatus::Complete)?;
        self.worker_id = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `verifying -> failed`. The one and only place retry budget is spent.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.set_status(TaskStatus::Failed)?;
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.worker_id = None;
        Ok(())
    }

    /// `failed -> pending`, re-opening the task for claiming.
    pub fn retry(&mut self) -> Result<()> {
        self.set_status(TaskStatus::Pending)?;
        self.worker_id = None;
        Ok(())
    }

    /// `{claimed,in_progress,verifying} -> worker_crash`. Keeps `worker_id`
    /// so the recovery log can name the dead worker; `requeue` clears it.
    /// Does NOT touch `retry_count` - crashes are infrastructure failures.
    pub fn crash(&mut self) -> Result<()> {
        self.set_status(TaskStatus::WorkerCrash)
    }

    /// `worker_crash -> pending`, clearing ownership.
    pub fn requeue(&mut self) -> Result<()> {
        self.set_status(TaskStatus::Pending)?;
        self.worker_id = None;
        Ok(())
    }

    /// `{claimed,in_progress} -> pending`: checkpoint release on graceful
    /// stop. No budget spent, no crash recorded.
    pub fn release(&mut self) -> Result<()> {
        self.set_status(TaskStatus::Pending)?;
        self.worker_id = None;
        Ok(())
    }

    /// `pending -> blocked` with a reason (a dependency can never complete).
    pub fn block(&mut self, reason: impl Into<String>) -> Result<()> {
        self.set_status(TaskStatus::Blocked)?;
        self.blocked_reason = Some(reason.into());
        Ok(())
    }

    /// `blocked -> pending`, used when a force-retry revives a dependency.
    pub fn unblock(&mut self) -> Result<()> {
        self.set_status(TaskStatus::Pending)?;
        self.blocked_reason = None;
        Ok(())
    }
}

/// One worker slot's persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: u32,
    pub status: WorkerStatus,
    pub current_task: Option<String>,
    pub branch: String,
    pub worktree: PathBuf,
    pub last_heartbeat: DateTime<Utc>,
    pub progress_pct: Option<u8>,
    pub respawns: u32,
}

impl WorkerState {
    pub fn new(worker_id: u32, branch: impl Into<String>, worktree: PathBuf) -> Self {
        Self {
            worker_id,
            status: WorkerStatus::Idle,
            current_task: None,
            branch: branch.into(),
            worktree,
            last_heartbeat: Utc::now(),
            progress_pct: None,
            respawns: 0,
        }
    }

    pub fn heartbeat(&mut self, now: DateTime<Utc>, progress_pct: Option<u8>) {
        self.last_heartbeat = now;
        if progress_pct.is_some() {
            self.progress_pct = progress_pct;
        }
    }

    pub fn assign(&mut self, task_id: impl Into<String>) {
        self.current_task = Some(task_id.into());
        self.status = WorkerStatus::Running;
    }

    pub fn clear_assignment(&mut self) {
        self.current_task = None;
        self.progress_pct = None;
        self.status = WorkerStatus::Idle;
    }
}

/// One level's persisted record. The level is the unit of the barrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelState {
    pub level_number: u32,
    pub status: LevelStatus,
    pub merge_status: MergeStatus,
}

impl LevelState {
    pub fn new(level_number: u32) -> Self {
        Self {
            level_number,
            status: LevelStatus::Pending,
            merge_status: MergeStatus::Pending,
        }
    }
}

/// The aggregate persisted unit: everything the engine knows about one
/// feature run. Mutated only through [`StateStore::mutate`], serialized as
/// a whole on every mutation.
///
/// [`StateStore::mutate`]: crate::state::StateStore::mutate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub feature: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub current_level: u32,
    pub tasks: BTreeMap<String, TaskState>,
    pub workers: BTreeMap<u32, WorkerState>,
    pub levels: BTreeMap<u32, LevelState>,
}

impl RunState {
    /// Seed a fresh run from a validated graph. Tasks start `pending`,
    /// levels start `pending`, `current_level` sits at the first level.
    pub fn new(feature: impl Into<String>, graph: &TaskGraph) -> Self {
        let tasks: BTreeMap<String, TaskState> = graph
            .specs()
            .iter()
            .map(|spec| (spec.id.clone(), TaskState::from_spec(spec)))
            .collect();
        let levels: BTreeMap<u32, LevelState> = graph
            .levels()
            .into_iter()
            .map(|n| (n, LevelState::new(n)))
            .collect();
        let current_level = levels.keys().next().copied().unwrap_or(1);
        Self {
            feature: feature.into(),
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            current_level,
            tasks,
            workers: BTreeMap::new(),
            levels,
        }
    }

    /// Short form of the run id for logs, like `3f2a9c1b`.
    pub fn short_run_id(&self) -> String {
        self.run_id.to_string().chars().take(8).collect()
    }

    pub fn task(&self, id: &str) -> Result<&TaskState> {
        self.tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn task_mut(&mut self, id: &str) -> Result<&mut TaskState> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn worker(&self, id: u32) -> Result<&WorkerState> {
        self.workers.get(&id).ok_or(Error::WorkerNotFound(id))
    }

    pub fn worker_mut(&mut self, id: u32) -> Result<&mut WorkerState> {
        self.workers.get_mut(&id).ok_or(Error::WorkerNotFound(id))
    }

    pub fn level(&self, n: u32) -> Option<&LevelState> {
        self.levels.get(&n)
    }

    pub fn level_mut(&mut self, n: u32) -> Option<&mut LevelState> {
        self.levels.get_mut(&n)
    }

    pub fn register_worker(&mut self, worker: WorkerState) {
        self.workers.insert(worker.worker_id, worker);
    }

    /// Tasks at a level, in ascending id order (BTreeMap iteration order).
    pub fn tasks_at_level(&self, level: u32) -> impl Iterator<Item = &TaskState> {
        self.tasks.values().filter(move |t| t.level == level)
    }

    /// (complete, total) across the whole run, for status output.
    pub fn progress(&self) -> (usize, usize) {
        let complete = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Complete)
            .count();
        (complete, self.tasks.len())
    }

    /// Whether every level has completed its merge.
    pub fn all_levels_complete(&self) -> bool {
        self.levels
            .values()
            .all(|l| l.status == LevelStatus::Complete && l.merge_status == MergeStatus::Complete)
    }
}
