//! Worker liveness supervision and crash recovery.
//!
//! Workers pulse heartbeats through the state store. The supervisor
//! flags any worker whose heartbeat has gone stale and recovers it:
//! the in-flight task goes back to `pending` through the `worker_crash`
//! transition, which by design leaves `retry_count` alone. A crash
//! spends respawn budget, not retry budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::state::{RunState, StateStore, WorkerStatus};
use crate::{mlog_warn, Result};

/// What `recover` did for one crashed worker.
#[derive(Debug, Clone)]
pub struct Recovery {
    /// Task returned to `pending`, if the worker held one.
    pub requeued_task: Option<String>,
    /// Whether the worker may be respawned (budget remaining).
    pub respawn: bool,
}

pub struct WorkerSupervisor {
    store: Arc<StateStore>,
    heartbeat_timeout: Duration,
    max_respawns: u32,
}

impl WorkerSupervisor {
    pub fn new(store: Arc<StateStore>, heartbeat_timeout: Duration, max_respawns: u32) -> Self {
        Self {
            store,
            heartbeat_timeout,
            max_respawns,
        }
    }

    pub fn from_config(store: Arc<StateStore>, config: &Config) -> Self {
        Self::new(store, config.heartbeat_timeout(), config.max_respawns)
    }

    /// Workers whose heartbeat is older than the timeout. Stopped and
    /// already-crashed workers are not expected to pulse.
    pub fn stale_workers(&self, state: &RunState, now: DateTime<Utc>) -> Vec<u32> {
        state
            .workers
            .values()
            .filter(|w| w.status.expects_heartbeat())
            .filter(|w| {
                now.signed_duration_since(w.last_heartbeat)
                    .to_std()
                    .map(|elapsed| elapsed > self.heartbeat_timeout)
                    .unwrap_or(false)
            })
            .map(|w| w.worker_id)
            .collect()
    }

    /// Recover a crashed worker in one atomic step: requeue its task via
    /// the crash path and either ready the slot for a respawn or retire
    /// it when the respawn budget is spent.
    pub async fn recover(&self, worker_id: u32) -> Result<Recovery> {
        let max_respawns = self.max_respawns;
        let now = Utc::now();
        let recovery = self
            .store
            .mutate(move |state| {
                let worker = state.worker_mut(worker_id)?;
                let held_task = worker.current_task.take();
                worker.progress_pct = None;

                let respawn = worker.respawns < max_respawns;
                if respawn {
                    worker.respawns += 1;
                    worker.status = WorkerStatus::Idle;
                    worker.last_heartbeat = now;
                } else {
                    worker.status = WorkerStatus::Crashed;
                }

                let mut requeued_task = None;
                if let Some(task_id) = held_task {
                    let task = state.task_mut(&task_id)?;
                    if task.status.is_active() {
                        task.crash()?;
                        task.requeue()?;
                        requeued_task = Some(task_id);
                    }
                }

                Ok(Recovery {
                    requeued_task,
                    respawn,
                })
            })
            .await?;

        mlog_warn!(
            "Worker {} crashed (requeued={:?}, respawn={})",
            worker_id,
            recovery.requeued_task,
            recovery.respawn
        );
        Ok(recovery)
    }
}
