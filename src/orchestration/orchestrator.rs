//! The run driver: level loop, crash recovery, pause and resume.
//!
//! `start_run` seeds worker branches and worktrees, persists the initial
//! state and spawns the run loop; `resume_run` reopens a persisted run,
//! walks every in-flight task through the crash path, and spawns the
//! same loop. The loop polls: recover stale workers, propagate blocks,
//! and when the current level settles hand it to the merge coordinator.
//! Promotion advances the level; a conflict, a failed required gate, a
//! permanently failed task, or a fully stalled claim loop pauses the run
//! in a stable, resumable state.

use std::collections::HashMap;
use std::fmt;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::git::GitOps;
use crate::graph::TaskGraph;
use crate::orchestration::claim;
use crate::orchestration::gates::GateRunner;
use crate::orchestration::merge::{LevelMerge, MergeCoordinator};
use crate::orchestration::supervisor::WorkerSupervisor;
use crate::orchestration::worker::{AssistantRunner, Worker, WorkerContext, WorkerExit};
use crate::policy::{BackpressureController, CircuitBreaker, RetryPolicy};
use crate::state::{
    MergeStatus, LevelStatus, RunState, StateStore, TaskStatus, WorkerState, WorkerStatus,
};
use crate::{mlog, mlog_warn, Error, Result};

/// Why a run stopped making progress. Every reason leaves the persisted
/// state stable; `maestro resume` picks the run back up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseReason {
    /// A worker branch conflicted with staging during the level merge.
    MergeConflict {
        level: u32,
        branch: String,
        files: Vec<String>,
    },
    /// A required quality gate failed against the staging checkout.
    GateFailure { level: u32, gates: Vec<String> },
    /// A task at the level failed permanently and needs intervention.
    LevelIncomplete { level: u32, unfinished: Vec<String> },
    /// Nothing claimable, nothing in flight, unfinished work remains.
    AllWorkersBlocked { level: u32 },
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::MergeConflict {
                level,
                branch,
                files,
            } => write!(
                f,
                "merge conflict at level {} from {}: {}",
                level,
                branch,
                files.join(", ")
            ),
            PauseReason::GateFailure { level, gates } => write!(
                f,
                "required gates failed at level {}: {}",
                level,
                gates.join(", ")
            ),
            PauseReason::LevelIncomplete { level, unfinished } => write!(
                f,
                "level {} cannot merge, unfinished tasks: {}",
                level,
                unfinished.join(", ")
            ),
            PauseReason::AllWorkersBlocked { level } => {
                write!(f, "no worker can make progress at level {level}")
            }
        }
    }
}

/// Terminal outcome of a run loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every level merged and promoted.
    Completed,
    /// The run stopped itself; see the reason.
    Paused(PauseReason),
    /// The caller stopped the run.
    Stopped,
}

/// Lifecycle notifications streamed to the caller while a run executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    LevelStarted {
        level: u32,
        tasks: usize,
    },
    TaskClaimed {
        task_id: String,
        worker_id: u32,
    },
    TaskCompleted {
        task_id: String,
        worker_id: u32,
    },
    TaskFailed {
        task_id: String,
        worker_id: u32,
        retry_count: u32,
        error: String,
    },
    TaskBlocked {
        task_id: String,
        reason: String,
    },
    WorkerCrashed {
        worker_id: u32,
        requeued_task: Option<String>,
        respawned: bool,
    },
    MergeStarted {
        level: u32,
    },
    LevelMerged {
        level: u32,
        commit: String,
    },
    RunPaused {
        reason: PauseReason,
    },
    RunCompleted {
        levels: u32,
    },
}

/// Owner's view of a running orchestration.
pub struct RunHandle {
    events: mpsc::Receiver<RunEvent>,
    cancel: CancellationToken,
    force: CancellationToken,
    join: JoinHandle<Result<RunOutcome>>,
}

impl RunHandle {
    /// Next lifecycle event, or `None` once the loop has shut its side.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// The raw event stream, for callers that select over it.
    pub fn events(&mut self) -> &mut mpsc::Receiver<RunEvent> {
        &mut self.events
    }

    /// Stop the run. Graceful lets each worker commit a checkpoint and
    /// release its task; force aborts workers and kills assistants,
    /// abandoning uncommitted work.
    pub fn stop(&self, graceful: bool) {
        if graceful {
            self.cancel.cancel();
        } else {
            self.force.cancel();
        }
    }

    /// Wait for the run to finish and return its outcome.
    pub async fn wait(self) -> Result<RunOutcome> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => Err(Error::TaskJoin(e.to_string())),
        }
    }
}

/// Entry points for starting, resuming and driving runs.
pub struct Orchestrator;

impl Orchestrator {
    /// Start a fresh run: create worker branches and worktrees off the
    /// base branch, persist the initial state, spawn the loop.
    ///
    /// # Errors
    /// Fails if the repo or base branch is missing, if a state file for
    /// the feature already exists, or if the assistant binary cannot be
    /// resolved.
    pub async fn start_run(
        graph: TaskGraph,
        config: Config,
        repo_path: &Path,
        feature: &str,
    ) -> Result<RunHandle> {
        let git = GitOps::new(repo_path)?;
        if !git.branch_exists(&config.base_branch)? {
            return Err(Error::Validation(format!(
                "base branch '{}' does not exist",
                config.base_branch
            )));
        }
        config.ensure_dirs(feature)?;
        let state_path = config.state_path(feature)?;
        if StateStore::exists(&state_path) {
            return Err(Error::RunExists(feature.to_string()));
        }

        let mut state = RunState::new(feature, &graph);
        let worktrees = config.worktrees_dir(feature)?;
        for worker_id in 0..config.workers as u32 {
            let branch = format!("maestro/{feature}/worker-{worker_id}");
            let worktree = worktrees.join(format!("worker-{worker_id}"));
            // No state file means no run owns these; clear leftovers from
            // an abandoned start of the same feature.
            if worktree.exists() {
                git.remove_worktree(&worktree)?;
            }
            if git.branch_exists(&branch)? {
                git.delete_branch(&branch)?;
            }
            git.create_worktree(&branch, &worktree, &config.base_branch)?;
            state.register_worker(WorkerState::new(worker_id, branch, worktree));
        }

        mlog!(
            "Run {} starting: feature '{}', {} tasks, {} workers",
            state.short_run_id(),
            feature,
            state.tasks.len(),
            config.workers
        );
        let store = Arc::new(StateStore::init(state_path, state)?);
        Self::launch(config, git, store)
    }

    /// Reopen a persisted run. In-flight tasks go through the crash path
    /// back to `pending` (budget untouched), failed tasks with budget are
    /// reopened (their backoff timers died with the process), interrupted
    /// merges are reset, missing worktrees reattached. `force` also
    /// revives permanently failed and blocked tasks with a fresh budget.
    pub async fn resume_run(
        config: Config,
        repo_path: &Path,
        feature: &str,
        force: bool,
    ) -> Result<RunHandle> {
        let git = GitOps::new(repo_path)?;
        let state_path = config.state_path(feature)?;
        if !StateStore::exists(&state_path) {
            return Err(Error::RunNotFound(feature.to_string()));
        }
        let store = Arc::new(StateStore::open(state_path)?);

        let max_retries = config.max_retries;
        let summary = store
            .mutate(move |state| recover_state(state, max_retries, force))
            .await?;
        mlog!("Resume recovery: {}", summary.describe());

        let state = store.snapshot().await;
        for level in &summary.reset_merges {
            let staging = MergeCoordinator::staging_branch(&state.feature, *level);
            if git.branch_exists(&staging)? {
                mlog_warn!("Discarding interrupted staging branch {}", staging);
                git.checkout_branch(&config.base_branch)?;
                git.delete_branch(&staging)?;
            }
        }
        for worker in state.workers.values() {
            if !worker.worktree.exists() {
                mlog_warn!(
                    "Worker {} worktree missing, reattaching {}",
                    worker.worker_id,
                    worker.branch
                );
                git.attach_worktree(&worker.branch, &worker.worktree)?;
            }
        }

        Self::launch(config, git, store)
    }

    /// Stop a run through its handle. See [`RunHandle::stop`].
    pub fn stop_run(handle: &RunHandle, graceful: bool) {
        handle.stop(graceful);
    }

    fn launch(config: Config, git: GitOps, store: Arc<StateStore>) -> Result<RunHandle> {
        let assistant = AssistantRunner::from_config(&config)?;
        let (events_tx, events_rx) = mpsc::channel(100);
        let cancel = CancellationToken::new();
        let force = CancellationToken::new();
        let run_loop = RunLoop::new(
            config,
            git,
            store,
            assistant,
            events_tx,
            cancel.clone(),
            force.clone(),
        );
        let join = tokio::spawn(run_loop.run());
        Ok(RunHandle {
            events: events_rx,
            cancel,
            force,
            join,
        })
    }
}

/// What resume recovery touched, for the log line.
#[derive(Debug, Default, PartialEq, Eq)]
struct ResumeSummary {
    requeued: Vec<String>,
    retried: Vec<String>,
    unblocked: Vec<String>,
    reset_merges: Vec<u32>,
}

impl ResumeSummary {
    fn describe(&self) -> String {
        format!(
            "{} requeued, {} retried, {} unblocked, {} interrupted merges",
            self.requeued.len(),
            self.retried.len(),
            self.unblocked.len(),
            self.reset_merges.len()
        )
    }
}

/// Bring a reopened state back to a runnable shape. Crash semantics
/// apply throughout: nothing here spends retry budget.
fn recover_state(state: &mut RunState, max_retries: u32, force: bool) -> Result<ResumeSummary> {
    let mut summary = ResumeSummary::default();

    let active: Vec<String> = state
        .tasks
        .values()
        .filter(|t| t.status.is_active())
        .map(|t| t.id.clone())
        .collect();
    for id in active {
        let task = state.task_mut(&id)?;
        task.crash()?;
        task.requeue()?;
        summary.requeued.push(id);
    }

    // A crash between the supervisor's two steps leaves worker_crash behind.
    let stranded: Vec<String> = state
        .tasks
        .values()
        .filter(|t| t.status == TaskStatus::WorkerCrash)
        .map(|t| t.id.clone())
        .collect();
    for id in stranded {
        state.task_mut(&id)?.requeue()?;
        summary.requeued.push(id);
    }

    let failed: Vec<String> = state
        .tasks
        .values()
        .filter(|t| t.status == TaskStatus::Failed)
        .map(|t| t.id.clone())
        .collect();
    for id in failed {
        let task = state.task_mut(&id)?;
        if force {
            task.retry_count = 0;
            task.retry()?;
            summary.retried.push(id);
        } else if task.retry_count < max_retries {
            task.retry()?;
            summary.retried.push(id);
        }
    }

    if force {
        let blocked: Vec<String> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Blocked)
            .map(|t| t.id.clone())
            .collect();
        for id in blocked {
            let task = state.task_mut(&id)?;
            task.retry_count = 0;
            task.unblock()?;
            summary.unblocked.push(id);
        }
    }

    for level in state.levels.values_mut() {
        if level.merge_status == MergeStatus::InProgress {
            level.merge_status = MergeStatus::Pending;
            summary.reset_merges.push(level.level_number);
        }
    }

    for worker in state.workers.values_mut() {
        worker.current_task = None;
        worker.progress_pct = None;
        worker.status = WorkerStatus::Idle;
        worker.last_heartbeat = Utc::now();
        // A new process gets a fresh respawn budget.
        worker.respawns = 0;
    }

    Ok(summary)
}

fn next_level_after(state: &RunState, from: u32) -> Option<u32> {
    state
        .levels
        .range((Bound::Excluded(from), Bound::Unbounded))
        .map(|(n, _)| *n)
        .next()
}

/// True when the claim loop can do nothing at all: no claimable task and
/// no task held by a worker. Sustained long enough, this pauses the run.
fn no_progress_possible(state: &RunState) -> bool {
    claim::claimable_tasks(state).is_empty()
        && !state.tasks.values().any(|t| t.status.is_active())
}

struct RunLoop {
    config: Config,
    git: GitOps,
    store: Arc<StateStore>,
    assistant: AssistantRunner,
    events: mpsc::Sender<RunEvent>,
    cancel: CancellationToken,
    force: CancellationToken,
    worker_cancel: CancellationToken,
    supervisor: WorkerSupervisor,
    merger: MergeCoordinator,
    retry_policy: RetryPolicy,
    verify_breaker: Arc<Mutex<CircuitBreaker>>,
    backpressure: Arc<Mutex<BackpressureController>>,
    workers: HashMap<u32, JoinHandle<Result<WorkerExit>>>,
    stalled_since: Option<Instant>,
}

impl RunLoop {
    fn new(
        config: Config,
        git: GitOps,
        store: Arc<StateStore>,
        assistant: AssistantRunner,
        events: mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
        force: CancellationToken,
    ) -> Self {
        let supervisor = WorkerSupervisor::from_config(Arc::clone(&store), &config);
        let merger = MergeCoordinator::new(
            git.clone(),
            Arc::clone(&store),
            GateRunner::from_config(&config),
            config.base_branch.clone(),
        );
        let retry_policy = RetryPolicy::from_config(&config);
        let verify_breaker = Arc::new(Mutex::new(CircuitBreaker::new(
            "verification",
            config.failure_threshold,
            config.cooldown(),
        )));
        let backpressure = Arc::new(Mutex::new(BackpressureController::new(config.window_size)));
        let worker_cancel = cancel.child_token();
        Self {
            config,
            git,
            store,
            assistant,
            events,
            cancel,
            force,
            worker_cancel,
            supervisor,
            merger,
            retry_policy,
            verify_breaker,
            backpressure,
            workers: HashMap::new(),
            stalled_since: None,
        }
    }

    async fn run(mut self) -> Result<RunOutcome> {
        let result = self.drive().await;
        match &result {
            Ok(outcome) => mlog!("Run loop finished: {:?}", outcome),
            Err(e) => mlog_warn!("Run loop failed: {}", e),
        }
        result
    }

    async fn drive(&mut self) -> Result<RunOutcome> {
        let state = self.store.snapshot().await;
        mlog!(
            "Run {} driving feature '{}' from level {}",
            state.short_run_id(),
            state.feature,
            state.current_level
        );
        self.open_level(state.current_level).await?;
        let worker_ids: Vec<u32> = state.workers.keys().copied().collect();
        for worker_id in worker_ids {
            self.spawn_worker(worker_id).await?;
        }

        loop {
            tokio::select! {
                _ = self.force.cancelled() => return self.force_stop(),
                _ = self.cancel.cancelled() => return self.graceful_stop().await,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
            if let Some(outcome) = self.poll().await? {
                return Ok(outcome);
            }
        }
    }

    /// One poll tick: supervision, block propagation, then either merge
    /// a settled level or watch for a stalled run.
    async fn poll(&mut self) -> Result<Option<RunOutcome>> {
        self.recover_stale_workers().await?;
        self.reap_finished_workers().await?;

        let max_retries = self.config.max_retries;
        let blocked = self
            .store
            .mutate(move |state| claim::propagate_blocked(state, max_retries))
            .await?;
        for (task_id, reason) in blocked {
            mlog_warn!("Task {} blocked: {}", task_id, reason);
            let _ = self
                .events
                .send(RunEvent::TaskBlocked { task_id, reason })
                .await;
        }

        let state = self.store.snapshot().await;
        let level = state.current_level;

        if claim::level_settled(&state, level, max_retries) {
            self.stalled_since = None;
            return self.merge_and_advance(level).await;
        }

        if let Some(reason) = self.check_stall(&state, level) {
            return self.pause(reason).await;
        }
        Ok(None)
    }

    /// Detect a run that cannot move: every worker crashed out of its
    /// respawn budget, or nothing claimable and nothing in flight past
    /// the grace period.
    fn check_stall(&mut self, state: &RunState, level: u32) -> Option<PauseReason> {
        let all_crashed = !state.workers.is_empty()
            && state
                .workers
                .values()
                .all(|w| w.status == WorkerStatus::Crashed);
        if all_crashed {
            mlog_warn!("Every worker has crashed past its respawn budget");
            return Some(PauseReason::AllWorkersBlocked { level });
        }

        if no_progress_possible(state) {
            match self.stalled_since {
                None => {
                    self.stalled_since = Some(Instant::now());
                    None
                }
                Some(since) if since.elapsed() >= self.config.blocked_grace() => {
                    mlog_warn!(
                        "No claimable or in-flight task for {:?}",
                        self.config.blocked_grace()
                    );
                    Some(PauseReason::AllWorkersBlocked { level })
                }
                Some(_) => None,
            }
        } else {
            self.stalled_since = None;
            None
        }
    }

    async fn recover_stale_workers(&mut self) -> Result<()> {
        let state = self.store.snapshot().await;
        for worker_id in self.supervisor.stale_workers(&state, Utc::now()) {
            if let Some(handle) = self.workers.remove(&worker_id) {
                handle.abort();
            }
            self.handle_crash(worker_id).await?;
        }
        Ok(())
    }

    /// A worker task that ended mid-run ended for a bad reason; clean
    /// exits only happen on stop.
    async fn reap_finished_workers(&mut self) -> Result<()> {
        let finished: Vec<u32> = self
            .workers
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for worker_id in finished {
            let handle = match self.workers.remove(&worker_id) {
                Some(handle) => handle,
                None => continue,
            };
            match handle.await {
                Ok(Ok(exit)) if !exit.is_crash() => {
                    mlog!("Worker {} exited cleanly ({})", worker_id, exit.code());
                }
                Ok(Ok(exit)) => {
                    mlog_warn!("Worker {} exited with code {}", worker_id, exit.code());
                    self.handle_crash(worker_id).await?;
                }
                Ok(Err(e)) => {
                    mlog_warn!("Worker {} harness failed: {}", worker_id, e);
                    self.handle_crash(worker_id).await?;
                }
                Err(e) => {
                    mlog_warn!("Worker {} task died: {}", worker_id, e);
                    self.handle_crash(worker_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_crash(&mut self, worker_id: u32) -> Result<()> {
        let recovery = self.supervisor.recover(worker_id).await?;
        let _ = self
            .events
            .send(RunEvent::WorkerCrashed {
                worker_id,
                requeued_task: recovery.requeued_task.clone(),
                respawned: recovery.respawn,
            })
            .await;
        if recovery.respawn {
            self.spawn_worker(worker_id).await?;
        }
        Ok(())
    }

    async fn spawn_worker(&mut self, worker_id: u32) -> Result<()> {
        let (branch, worktree) = self
            .store
            .read(move |state| -> Result<(String, PathBuf)> {
                let worker = state.worker(worker_id)?;
                Ok((worker.branch.clone(), worker.worktree.clone()))
            })
            .await?;
        let ctx = WorkerContext {
            worker_id,
            store: Arc::clone(&self.store),
            git: self.git.clone(),
            branch,
            worktree,
            config: self.config.clone(),
            assistant: self.assistant.clone(),
            retry_policy: self.retry_policy.clone(),
            verify_breaker: Arc::clone(&self.verify_breaker),
            backpressure: Arc::clone(&self.backpressure),
            events: self.events.clone(),
            cancel: self.worker_cancel.clone(),
        };
        let handle = tokio::spawn(Worker::new(ctx).run());
        self.workers.insert(worker_id, handle);
        Ok(())
    }

    async fn merge_and_advance(&mut self, level: u32) -> Result<Option<RunOutcome>> {
        let _ = self.events.send(RunEvent::MergeStarted { level }).await;
        match self.merger.merge_level(level).await? {
            LevelMerge::Promoted { commit, .. } => {
                let _ = self
                    .events
                    .send(RunEvent::LevelMerged { level, commit })
                    .await;
                let next = self
                    .store
                    .mutate(move |state| {
                        let next = next_level_after(state, level);
                        if let Some(n) = next {
                            state.current_level = n;
                        }
                        Ok(next)
                    })
                    .await?;
                match next {
                    Some(next) => {
                        self.open_level(next).await?;
                        Ok(None)
                    }
                    None => {
                        self.finish_run().await?;
                        Ok(Some(RunOutcome::Completed))
                    }
                }
            }
            LevelMerge::Conflicted { branch, files } => {
                self.pause(PauseReason::MergeConflict {
                    level,
                    branch,
                    files,
                })
                .await
            }
            LevelMerge::GatesFailed { gates } => {
                let failing = gates
                    .iter()
                    .filter(|g| g.blocks_promotion())
                    .map(|g| g.name.clone())
                    .collect();
                self.pause(PauseReason::GateFailure {
                    level,
                    gates: failing,
                })
                .await
            }
            LevelMerge::Incomplete { unfinished } => {
                self.pause(PauseReason::LevelIncomplete { level, unfinished })
                    .await
            }
        }
    }

    async fn open_level(&self, level: u32) -> Result<()> {
        let tasks = self
            .store
            .mutate(move |state| {
                if let Some(l) = state.level_mut(level) {
                    if l.status == LevelStatus::Pending {
                        l.status = LevelStatus::Running;
                    }
                }
                Ok(state.tasks_at_level(level).count())
            })
            .await?;
        mlog!("Level {} open with {} tasks", level, tasks);
        let _ = self.events.send(RunEvent::LevelStarted { level, tasks }).await;
        Ok(())
    }

    async fn pause(&mut self, reason: PauseReason) -> Result<Option<RunOutcome>> {
        mlog_warn!("Run paused: {}", reason);
        let _ = self
            .events
            .send(RunEvent::RunPaused {
                reason: reason.clone(),
            })
            .await;
        self.stop_workers().await;
        Ok(Some(RunOutcome::Paused(reason)))
    }

    async fn stop_workers(&mut self) {
        self.worker_cancel.cancel();
        for (worker_id, handle) in self.workers.drain() {
            if let Err(e) = handle.await {
                mlog_warn!("Worker {} join: {}", worker_id, e);
            }
        }
    }

    async fn graceful_stop(&mut self) -> Result<RunOutcome> {
        mlog!("Graceful stop requested");
        self.worker_cancel.cancel();
        let worker_ids: Vec<u32> = self.workers.keys().copied().collect();
        for worker_id in worker_ids {
            if let Some(mut handle) = self.workers.remove(&worker_id) {
                tokio::select! {
                    _ = self.force.cancelled() => handle.abort(),
                    res = &mut handle => {
                        if let Err(e) = res {
                            mlog_warn!("Worker {} join on stop: {}", worker_id, e);
                        }
                    }
                }
            }
        }
        Ok(RunOutcome::Stopped)
    }

    fn force_stop(&mut self) -> Result<RunOutcome> {
        mlog_warn!("Force stop, aborting workers");
        self.worker_cancel.cancel();
        for (_, handle) in self.workers.drain() {
            handle.abort();
        }
        Ok(RunOutcome::Stopped)
    }

    /// All levels promoted: stop workers, drop their branches and
    /// worktrees, announce completion. The state file stays as a record.
    async fn finish_run(&mut self) -> Result<()> {
        self.stop_workers().await;
        let state = self.store.snapshot().await;
        for worker in state.workers.values() {
            if let Err(e) = self.git.remove_worktree(&worker.worktree) {
                mlog_warn!("Worktree cleanup for worker {}: {}", worker.worker_id, e);
            }
            if let Err(e) = self.git.delete_branch(&worker.branch) {
                mlog_warn!("Branch cleanup for worker {}: {}", worker.worker_id, e);
            }
        }
        let levels = state.levels.len() as u32;
        mlog!(
            "Run complete: {} levels promoted to {}",
            levels,
            self.config.base_branch
        );
        let _ = self.events.send(RunEvent::RunCompleted { levels }).await;
        Ok(())
    }
}
