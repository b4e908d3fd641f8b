//! Worker harness: the claim/execute/verify loop and its API surface.
//!
//! Each worker is a tokio task bound to one git worktree. The loop
//! claims a task, runs the assistant subprocess in the worktree, runs
//! the task's verification command, then either commits and records
//! `complete` or records `failed` and schedules a retry after backoff.
//! Heartbeats pulse whenever the harness is alive, including while the
//! assistant subprocess runs. All state changes go through `WorkerApi`,
//! which enforces task ownership and the status transition table.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::git::GitOps;
use crate::orchestration::claim;
use crate::orchestration::gates::{run_command, CommandResult};
use crate::orchestration::orchestrator::RunEvent;
use crate::policy::{BackpressureController, CircuitBreaker, RetryPolicy};
use crate::state::{StateStore, TaskState, TaskStatus, WorkerStatus};
use crate::{mlog, mlog_debug, mlog_warn, Error, Result};

/// Worker exit convention: 0 success, 2 checkpoint, 3 all remaining
/// tasks blocked, anything else a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Success,
    Checkpoint,
    AllBlocked,
    Crash(i32),
}

impl WorkerExit {
    pub fn code(&self) -> i32 {
        match self {
            WorkerExit::Success => 0,
            WorkerExit::Checkpoint => 2,
            WorkerExit::AllBlocked => 3,
            WorkerExit::Crash(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => WorkerExit::Success,
            2 => WorkerExit::Checkpoint,
            3 => WorkerExit::AllBlocked,
            other => WorkerExit::Crash(other),
        }
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, WorkerExit::Crash(_))
    }
}

/// What the assistant subprocess did with a task.
#[derive(Debug, Clone)]
pub enum AssistantOutcome {
    Completed,
    Failed { detail: String },
    TimedOut,
}

/// Runs the coding assistant as a subprocess in a worktree.
///
/// The binary is resolved once with `which`; arguments come from the
/// config's template, with `{prompt}` replaced per task. Task metadata
/// travels in `MAESTRO_*` environment variables so wrappers and fakes
/// can read it without parsing the prompt.
#[derive(Debug, Clone)]
pub struct AssistantRunner {
    binary: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl AssistantRunner {
    /// # Errors
    /// Fails if the configured assistant binary is not on PATH.
    pub fn from_config(config: &Config) -> Result<Self> {
        let binary =
            which::which(&config.assistant_bin).map_err(|_| Error::AssistantBinaryNotFound)?;
        Ok(Self {
            binary,
            args: config.assistant_args.clone(),
            timeout: config.assistant_timeout(),
        })
    }

    pub fn with_binary(binary: PathBuf, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            binary,
            args,
            timeout,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn build_prompt(task: &TaskState) -> String {
        let mut prompt = format!(
            "You are completing one task of a larger feature.\n\nTask {}: {}\n",
            task.id, task.title
        );
        if !task.files.create.is_empty() {
            prompt.push_str(&format!(
                "Create: {}\n",
                task.files.create.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        if !task.files.modify.is_empty() {
            prompt.push_str(&format!(
                "Modify: {}\n",
                task.files.modify.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        if !task.files.read.is_empty() {
            prompt.push_str(&format!(
                "Read-only context: {}\n",
                task.files.read.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        prompt.push_str(&format!(
            "\nTouch only the listed files. When you are done, this must pass: {}\n",
            task.verification.command
        ));
        prompt
    }

    fn substituted_args(&self, prompt: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{prompt}", prompt))
            .collect()
    }

    fn joined(set: &std::collections::BTreeSet<String>) -> String {
        set.iter().cloned().collect::<Vec<_>>().join(",")
    }

    /// Execute the assistant for one task. A non-zero exit is a task
    /// failure; a spawn error is an environment problem and bubbles up.
    pub async fn run(&self, task: &TaskState, cwd: &Path) -> Result<AssistantOutcome> {
        let prompt = Self::build_prompt(task);
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .args(self.substituted_args(&prompt))
                .env("MAESTRO_TASK_ID", &task.id)
                .env("MAESTRO_TASK_TITLE", &task.title)
                .env("MAESTRO_TASK_CREATE", Self::joined(&task.files.create))
                .env("MAESTRO_TASK_MODIFY", Self::joined(&task.files.modify))
                .env("MAESTRO_TASK_READ", Self::joined(&task.files.read))
                .env("MAESTRO_VERIFY_CMD", &task.verification.command)
                .current_dir(cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match output {
            Err(_) => Ok(AssistantOutcome::TimedOut),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(out)) => {
                if out.status.success() {
                    Ok(AssistantOutcome::Completed)
                } else {
                    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
                    let detail = if stderr.is_empty() {
                        format!("exit code {}", out.status.code().unwrap_or(-1))
                    } else {
                        stderr
                    };
                    Ok(AssistantOutcome::Failed { detail })
                }
            }
        }
    }
}

/// The core surface a worker talks to. Every call checks that the
/// worker actually owns the task it is reporting on.
#[derive(Clone)]
pub struct WorkerApi {
    store: Arc<StateStore>,
    git: GitOps,
}

impl WorkerApi {
    pub fn new(store: Arc<StateStore>, git: GitOps) -> Self {
        Self { store, git }
    }

    /// Claim the next claimable task for this worker, atomically.
    pub async fn claim_next_task(&self, worker_id: u32) -> Result<Option<TaskState>> {
        self.store
            .mutate(move |state| {
                let claimed = claim::claim_next(state, worker_id)?;
                match claimed {
                    Some(id) => Ok(Some(state.task(&id)?.clone())),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Move an owned task along its lifecycle. Workers may move a task
    /// to `in_progress`, `verifying`, `complete`, or release it back to
    /// `pending`; everything else is the orchestrator's business.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        worker_id: u32,
    ) -> Result<()> {
        let task_id = task_id.to_string();
        self.store
            .mutate(move |state| {
                let task = state.task_mut(&task_id)?;
                if task.worker_id != Some(worker_id) {
                    return Err(Error::NotTaskOwner { task_id, worker_id });
                }
                match new_status {
                    TaskStatus::InProgress => task.start()?,
                    TaskStatus::Verifying => task.begin_verification()?,
                    TaskStatus::Complete => task.complete()?,
                    TaskStatus::Pending => task.release()?,
                    other => {
                        return Err(Error::Validation(format!(
                            "workers cannot move a task to {}",
                            other.as_str()
                        )))
                    }
                }

                let worker = state.worker_mut(worker_id)?;
                match new_status {
                    TaskStatus::InProgress => worker.status = WorkerStatus::Running,
                    TaskStatus::Verifying => worker.status = WorkerStatus::Verifying,
                    TaskStatus::Complete | TaskStatus::Pending => worker.clear_assignment(),
                    _ => {}
                }
                Ok(())
            })
            .await
    }

    /// Record a verification failure. Increments the retry budget spend
    /// and frees the worker. Returns the new retry count.
    pub async fn report_failure(
        &self,
        task_id: &str,
        worker_id: u32,
        error: &str,
    ) -> Result<u32> {
        let task_id = task_id.to_string();
        let error = error.to_string();
        self.store
            .mutate(move |state| {
                let task = state.task_mut(&task_id)?;
                if task.worker_id != Some(worker_id) {
                    return Err(Error::NotTaskOwner { task_id, worker_id });
                }
                task.fail(error)?;
                let retry_count = task.retry_count;
                state.worker_mut(worker_id)?.clear_assignment();
                Ok(retry_count)
            })
            .await
    }

    /// Return a failed task to `pending` after its backoff elapsed.
    pub async fn retry_task(&self, task_id: &str) -> Result<()> {
        let task_id = task_id.to_string();
        self.store
            .mutate(move |state| state.task_mut(&task_id)?.retry())
            .await
    }

    pub async fn record_heartbeat(&self, worker_id: u32, progress_pct: Option<u8>) -> Result<()> {
        self.store
            .mutate(move |state| {
                state.worker_mut(worker_id)?.heartbeat(Utc::now(), progress_pct);
                Ok(())
            })
            .await
    }

    /// Commit everything in the worker's worktree, then record the task
    /// `complete`. Returns the commit id, or `None` when the assistant
    /// left the worktree clean.
    pub async fn commit_and_mark_complete(
        &self,
        task_id: &str,
        worker_id: u32,
    ) -> Result<Option<String>> {
        let (worktree, title) = self
            .store
            .read(|state| -> Result<(PathBuf, String)> {
                let task = state.task(task_id)?;
                if task.worker_id != Some(worker_id) {
                    return Err(Error::NotTaskOwner {
                        task_id: task_id.to_string(),
                        worker_id,
                    });
                }
                let worker = state.worker(worker_id)?;
                Ok((worker.worktree.clone(), task.title.clone()))
            })
            .await?;

        let commit = if self.git.is_dirty(&worktree)? {
            let message = format!("{task_id}: {title}");
            Some(self.git.commit_all(&worktree, &message)?)
        } else {
            mlog_warn!("Task {} completed with no file changes", task_id);
            None
        };

        self.update_task_status(task_id, TaskStatus::Complete, worker_id)
            .await?;
        Ok(commit)
    }
}

/// Everything one worker harness needs, bundled for the spawn.
pub struct WorkerContext {
    pub worker_id: u32,
    pub store: Arc<StateStore>,
    pub git: GitOps,
    pub branch: String,
    pub worktree: PathBuf,
    pub config: Config,
    pub assistant: AssistantRunner,
    pub retry_policy: RetryPolicy,
    pub verify_breaker: Arc<Mutex<CircuitBreaker>>,
    pub backpressure: Arc<Mutex<BackpressureController>>,
    pub events: mpsc::Sender<RunEvent>,
    pub cancel: CancellationToken,
}

enum AssistantRun {
    Done(AssistantOutcome),
    Cancelled,
}

pub struct Worker {
    ctx: WorkerContext,
    api: WorkerApi,
}

impl Worker {
    pub fn new(ctx: WorkerContext) -> Self {
        let api = WorkerApi::new(Arc::clone(&ctx.store), ctx.git.clone());
        Self { ctx, api }
    }

    /// The harness loop. Runs until cancelled; a returned error means
    /// the harness itself died and the supervisor should recover it.
    pub async fn run(self) -> Result<WorkerExit> {
        let worker_id = self.ctx.worker_id;
        mlog!("Worker {} online on {}", worker_id, self.ctx.branch);

        loop {
            if self.ctx.cancel.is_cancelled() {
                break;
            }
            self.api.record_heartbeat(worker_id, None).await?;

            let (allows, delay) = {
                let bp = self.ctx.backpressure.lock().await;
                (
                    bp.allows_claims(),
                    bp.claim_delay(self.ctx.config.poll_interval()),
                )
            };
            if !allows {
                mlog_debug!("Worker {} holding claims (backpressure red)", worker_id);
                if self.cancelled_or_sleep(delay).await {
                    break;
                }
                continue;
            }

            match self.api.claim_next_task(worker_id).await? {
                None => {
                    if self.cancelled_or_sleep(delay).await {
                        break;
                    }
                }
                Some(task) => {
                    let _ = self
                        .ctx
                        .events
                        .send(RunEvent::TaskClaimed {
                            task_id: task.id.clone(),
                            worker_id,
                        })
                        .await;
                    self.execute(task).await?;
                }
            }
        }

        self.ctx
            .store
            .mutate(move |state| {
                let worker = state.worker_mut(worker_id)?;
                if worker.status != WorkerStatus::Crashed {
                    worker.status = WorkerStatus::Stopped;
                }
                Ok(())
            })
            .await?;
        mlog!("Worker {} stopped", worker_id);
        Ok(WorkerExit::Success)
    }

    /// True when the cancel token fired during the sleep.
    async fn cancelled_or_sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    async fn execute(&self, task: TaskState) -> Result<()> {
        let worker_id = self.ctx.worker_id;
        let task_id = task.id.clone();
        mlog!("Worker {} starting task {}", worker_id, task_id);

        self.api
            .update_task_status(&task_id, TaskStatus::InProgress, worker_id)
            .await?;

        let outcome = match self.run_assistant(&task).await? {
            AssistantRun::Cancelled => {
                self.checkpoint(&task_id).await?;
                return Ok(());
            }
            AssistantRun::Done(outcome) => outcome,
        };

        // Assistant failures surface through the verification phase so
        // the task walks the normal in_progress -> verifying -> failed
        // chain either way.
        self.api
            .update_task_status(&task_id, TaskStatus::Verifying, worker_id)
            .await?;

        let verdict = match outcome {
            AssistantOutcome::Completed => self.verify(&task).await,
            AssistantOutcome::Failed { detail } => Err(format!("assistant failed: {detail}")),
            AssistantOutcome::TimedOut => Err(format!(
                "assistant timed out after {}s",
                self.ctx.config.assistant_timeout_secs
            )),
        };

        match verdict {
            Ok(()) => {
                let commit = self
                    .api
                    .commit_and_mark_complete(&task_id, worker_id)
                    .await?;
                self.ctx.backpressure.lock().await.record(true);
                mlog!(
                    "Worker {} completed {}{}",
                    worker_id,
                    task_id,
                    commit
                        .as_deref()
                        .map(|c| format!(" at {c:.7}"))
                        .unwrap_or_default()
                );
                let _ = self
                    .ctx
                    .events
                    .send(RunEvent::TaskCompleted { task_id, worker_id })
                    .await;
            }
            Err(detail) => {
                self.discard_worktree_changes()?;
                let retry_count = self
                    .api
                    .report_failure(&task_id, worker_id, &detail)
                    .await?;
                self.ctx.backpressure.lock().await.record(false);
                mlog_warn!(
                    "Worker {} failed {} (attempt {}): {}",
                    worker_id,
                    task_id,
                    retry_count,
                    detail
                );
                let _ = self
                    .ctx
                    .events
                    .send(RunEvent::TaskFailed {
                        task_id: task_id.clone(),
                        worker_id,
                        retry_count,
                        error: detail,
                    })
                    .await;

                if self.ctx.retry_policy.should_retry(retry_count) {
                    let backoff = self.ctx.retry_policy.next_backoff(retry_count);
                    mlog!("Task {} retries in {:?}", task_id, backoff);
                    Self::schedule_retry(self.api.clone(), task_id, backoff, self.ctx.cancel.clone());
                } else {
                    mlog_warn!("Task {} is out of retries", task_id);
                }
            }
        }
        Ok(())
    }

    /// Graceful-stop path: commit whatever the assistant left behind to
    /// the worker branch, then hand the task back to `pending`. The next
    /// claimant continues from the committed work-in-progress.
    async fn checkpoint(&self, task_id: &str) -> Result<()> {
        let worker_id = self.ctx.worker_id;
        self.ctx
            .store
            .mutate(move |state| {
                state.worker_mut(worker_id)?.status = WorkerStatus::Checkpoint;
                Ok(())
            })
            .await?;

        if self.ctx.git.is_dirty(&self.ctx.worktree)? {
            let commit = self
                .ctx
                .git
                .commit_all(&self.ctx.worktree, &format!("{task_id}: checkpoint"))?;
            mlog!(
                "Worker {} checkpointed {} at {:.7}",
                worker_id,
                task_id,
                commit
            );
        }
        self.api
            .update_task_status(task_id, TaskStatus::Pending, worker_id)
            .await?;
        mlog!("Worker {} released {} on shutdown", worker_id, task_id);
        Ok(())
    }

    /// Run the assistant while keeping heartbeats flowing. The pulse is
    /// a third of the heartbeat timeout so one missed tick never kills
    /// a healthy worker.
    async fn run_assistant(&self, task: &TaskState) -> Result<AssistantRun> {
        let pulse = (self.ctx.config.heartbeat_timeout() / 3).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(pulse);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let fut = self.ctx.assistant.run(task, &self.ctx.worktree);
        tokio::pin!(fut);
        loop {
            tokio::select! {
                res = &mut fut => return Ok(AssistantRun::Done(res?)),
                _ = ticker.tick() => {
                    self.api.record_heartbeat(self.ctx.worker_id, None).await?;
                }
                _ = self.ctx.cancel.cancelled() => return Ok(AssistantRun::Cancelled),
            }
        }
    }

    /// Run the task's verification command, guarded by the shared
    /// verification breaker. While the breaker is open the command is
    /// not even attempted.
    async fn verify(&self, task: &TaskState) -> std::result::Result<(), String> {
        let allowed = {
            self.ctx
                .verify_breaker
                .lock()
                .await
                .allow_request(Instant::now())
        };
        if !allowed {
            return Err("verification skipped: circuit open".to_string());
        }

        let result = run_command(
            &task.verification.command,
            &self.ctx.worktree,
            task.verification.timeout(),
        )
        .await;

        let mut breaker = self.ctx.verify_breaker.lock().await;
        match result {
            r if r.is_success() => {
                breaker.record_success();
                Ok(())
            }
            CommandResult::TimedOut => {
                breaker.record_failure(Instant::now());
                Err(format!(
                    "verification timed out after {}s",
                    task.verification.timeout_seconds
                ))
            }
            r => {
                breaker.record_failure(Instant::now());
                Err(format!("verification failed: {}", r.failure_detail()))
            }
        }
    }

    /// Drop uncommitted changes so the next attempt starts from the
    /// branch tip, not from a half-finished edit.
    fn discard_worktree_changes(&self) -> Result<()> {
        if self.ctx.git.is_dirty(&self.ctx.worktree)? {
            let tip = self.ctx.git.branch_commit(&self.ctx.branch)?;
            self.ctx.git.reset_worktree_to(&self.ctx.worktree, &tip)?;
        }
        Ok(())
    }

    fn schedule_retry(
        api: WorkerApi,
        task_id: String,
        backoff: Duration,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(backoff) => {
                    if let Err(e) = api.retry_task(&task_id).await {
                        mlog_warn!("Retry of {} not scheduled: {}", task_id, e);
                    }
                }
            }
        });
    }
}
