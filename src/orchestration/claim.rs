//! Dependency checking and task claiming.
//!
//! All functions here are pure over `RunState`; the async surface wraps
//! them in `StateStore::mutate` so a claim and its persistence are one
//! atomic step. Claim order is deterministic: ascending task id, which
//! the state's BTreeMap gives for free.

use crate::state::{RunState, TaskState, TaskStatus};
use crate::{Error, Result};

/// A task is claimable when it is pending, sits at the run's current
/// level, and every dependency has completed.
pub fn is_claimable(state: &RunState, task_id: &str) -> bool {
    let Ok(task) = state.task(task_id) else {
        return false;
    };
    if task.status != TaskStatus::Pending || task.level != state.current_level {
        return false;
    }
    task.dependencies.iter().all(|dep| {
        state
            .task(dep)
            .map(|d| d.status == TaskStatus::Complete)
            .unwrap_or(false)
    })
}

/// Claimable task ids in ascending order.
pub fn claimable_tasks(state: &RunState) -> Vec<String> {
    state
        .tasks
        .keys()
        .filter(|id| is_claimable(state, id))
        .cloned()
        .collect()
}

/// Claim the first claimable task for `worker_id`. Returns the claimed
/// task id, or `None` when nothing is claimable.
///
/// # Errors
/// `Error::ClaimConflict` if the selected task already carries another
/// worker's id. That cannot happen while all claims go through
/// `StateStore::mutate`; seeing it means the state was corrupted.
pub fn claim_next(state: &mut RunState, worker_id: u32) -> Result<Option<String>> {
    let Some(task_id) = claimable_tasks(state).into_iter().next() else {
        return Ok(None);
    };

    let task = state.task_mut(&task_id)?;
    if let Some(held_by) = task.worker_id {
        if held_by != worker_id {
            return Err(Error::ClaimConflict {
                task_id,
                held_by,
                claimed_by: worker_id,
            });
        }
    }
    task.claim(worker_id)?;

    let worker = state.worker_mut(worker_id)?;
    worker.assign(task_id.clone());

    Ok(Some(task_id))
}

/// Whether a task can never run again without operator intervention.
fn is_spent(task: &TaskState, max_retries: u32) -> bool {
    match task.status {
        TaskStatus::Blocked => true,
        TaskStatus::Failed => task.retry_count >= max_retries,
        _ => false,
    }
}

/// Whether every task at `level` has settled: complete, blocked, or
/// failed with no retry budget left. A failed task that still has budget
/// is counted as in flight, since its retry has not landed yet.
pub fn level_settled(state: &RunState, level: u32, max_retries: u32) -> bool {
    state.tasks_at_level(level).all(|task| {
        task.status == TaskStatus::Complete || is_spent(task, max_retries)
    })
}

/// Block every pending task with a dead dependency, transitively.
/// Returns the newly blocked tasks with their reasons.
pub fn propagate_blocked(state: &mut RunState, max_retries: u32) -> Result<Vec<(String, String)>> {
    let mut newly_blocked = Vec::new();
    loop {
        let mut candidate = None;
        for task in state.tasks.values() {
            if task.status != TaskStatus::Pending {
                continue;
            }
            let dead_dep = task.dependencies.iter().find(|dep| {
                state
                    .task(dep)
                    .map(|d| is_spent(d, max_retries))
                    .unwrap_or(false)
            });
            if let Some(dep) = dead_dep {
                let verb = match state.task(dep)?.status {
                    TaskStatus::Blocked => "is blocked",
                    _ => "failed permanently",
                };
                candidate = Some((task.id.clone(), format!("dependency {dep} {verb}")));
                break;
            }
        }
        match candidate {
            Some((id, reason)) => {
                state.task_mut(&id)?.block(reason.clone())?;
                newly_blocked.push((id, reason));
            }
            None => break,
        }
    }
    Ok(newly_blocked)
}
