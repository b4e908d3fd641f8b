//! Stop, crash, resume: runs surviving process death with their state
//! intact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use maestro::orchestration::{GateConfig, Orchestrator, PauseReason, RunEvent, RunOutcome};
use maestro::state::{RunState, TaskStatus};

use crate::fixtures::{
    drain_events, graph, read_state, sh_args, task, task_creating, wait_for, TestBed,
    SCRIPTED_ASSISTANT,
};

/// Test: A force-stopped run resumes and completes without spending
/// retry budget.
///
/// Given: A run force-stopped while its only task is in flight
/// When: The feature is resumed with a healthy assistant
/// Then: The interrupted task is requeued with retry_count 0 and the
///       run completes
#[tokio::test(flavor = "multi_thread")]
async fn test_force_stop_then_resume_completes() {
    let mut bed = TestBed::new();
    bed.config = bed.config.with_assistant("sh", sh_args("sleep 30"));
    let g = graph(vec![task_creating("slow", 1, &["slow.txt"])]);

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "crashy")
        .await
        .expect("start_run");
    wait_for(&mut handle, |e| matches!(e, RunEvent::TaskClaimed { .. })).await;
    handle.stop(false);
    let outcome = handle.wait().await.expect("run result");
    assert_eq!(outcome, RunOutcome::Stopped);

    // The state file looks exactly like a crash: the task still held by
    // its worker.
    let state = read_state(&bed.config, "crashy");
    assert!(state.task("slow").unwrap().status.is_active());

    let resumed_config = bed
        .config
        .clone()
        .with_assistant("sh", sh_args(SCRIPTED_ASSISTANT));
    let mut handle = Orchestrator::resume_run(resumed_config.clone(), &bed.repo.path, "crashy", false)
        .await
        .expect("resume_run");
    drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("resume result");

    assert_eq!(outcome, RunOutcome::Completed);
    let state = read_state(&resumed_config, "crashy");
    let slow = state.task("slow").unwrap();
    assert_eq!(slow.status, TaskStatus::Complete);
    assert_eq!(slow.retry_count, 0);
    assert!(bed.repo.show_file("main", "slow.txt").is_some());
}

/// Test: Graceful stop checkpoints in-flight work onto the worker branch.
///
/// Given: An assistant stopped mid-task after writing a work-in-progress
///        file
/// When: The run is stopped gracefully and later resumed
/// Then: The WIP lands as a checkpoint commit, the task goes back to
///       pending, and the resumed run carries both the WIP and the
///       declared file to main
#[tokio::test(flavor = "multi_thread")]
async fn test_graceful_stop_checkpoints_and_resume_continues() {
    let mut bed = TestBed::new();
    bed.config = bed
        .config
        .with_assistant("sh", sh_args("printf 'wip\\n' > wip.txt\nsleep 30"));
    let g = graph(vec![task_creating("models", 1, &["final.txt"])]);

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "pausable")
        .await
        .expect("start_run");
    let claimed = wait_for(&mut handle, |e| matches!(e, RunEvent::TaskClaimed { .. })).await;
    let worker_id = match claimed {
        RunEvent::TaskClaimed { worker_id, .. } => worker_id,
        _ => unreachable!(),
    };
    // Let the script get its WIP file written before stopping.
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.stop(true);
    let outcome = handle.wait().await.expect("run result");
    assert_eq!(outcome, RunOutcome::Stopped);

    let branch = format!("maestro/pausable/worker-{worker_id}");
    assert_eq!(bed.repo.last_commit_message(&branch), "models: checkpoint");
    assert!(bed.repo.show_file(&branch, "wip.txt").is_some());

    let state = read_state(&bed.config, "pausable");
    assert_eq!(state.task("models").unwrap().status, TaskStatus::Pending);

    let resumed_config = bed
        .config
        .clone()
        .with_assistant("sh", sh_args(SCRIPTED_ASSISTANT));
    let mut handle =
        Orchestrator::resume_run(resumed_config.clone(), &bed.repo.path, "pausable", false)
            .await
            .expect("resume_run");
    drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("resume result");

    assert_eq!(outcome, RunOutcome::Completed);
    let state = read_state(&resumed_config, "pausable");
    let models = state.task("models").unwrap();
    assert_eq!(models.status, TaskStatus::Complete);
    assert_eq!(models.retry_count, 0);
    assert!(bed.repo.show_file("main", "wip.txt").is_some());
    assert!(bed.repo.show_file("main", "final.txt").is_some());
}

/// Test: Resume reattaches a worktree whose directory disappeared.
///
/// Given: A force-stopped run with one worker's worktree deleted from
///        disk
/// When: The feature is resumed
/// Then: The worktree is recreated from its branch and the run completes
#[tokio::test(flavor = "multi_thread")]
async fn test_resume_reattaches_deleted_worktree() {
    let mut bed = TestBed::new();
    bed.config = bed.config.with_assistant("sh", sh_args("sleep 30"));
    let g = graph(vec![task_creating("solo", 1, &["solo.txt"])]);

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "lost-wt")
        .await
        .expect("start_run");
    wait_for(&mut handle, |e| matches!(e, RunEvent::TaskClaimed { .. })).await;
    handle.stop(false);
    handle.wait().await.expect("run result");

    let gone = bed.config.worktrees_dir("lost-wt").unwrap().join("worker-0");
    assert!(gone.exists());
    std::fs::remove_dir_all(&gone).unwrap();

    let resumed_config = bed
        .config
        .clone()
        .with_assistant("sh", sh_args(SCRIPTED_ASSISTANT));
    let mut handle =
        Orchestrator::resume_run(resumed_config.clone(), &bed.repo.path, "lost-wt", false)
            .await
            .expect("resume_run");
    drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("resume result");

    assert_eq!(outcome, RunOutcome::Completed);
    assert!(bed.repo.show_file("main", "solo.txt").is_some());
}

/// Test: Resuming a spent run without force pauses again; force revives.
///
/// Given: A run paused with its task permanently failed
/// When: It is resumed without force, then with force and a fixed
///       assistant
/// Then: The plain resume pauses on the same level; the forced resume
///       resets the budget and completes
#[tokio::test(flavor = "multi_thread")]
async fn test_resume_without_force_stays_paused_then_force_revives() {
    let mut bed = TestBed::new();
    bed.config = bed
        .config
        .with_assistant("sh", sh_args("echo broken >&2; exit 1"));
    let g = graph(vec![task("bad", 1)]);

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "revive")
        .await
        .expect("start_run");
    drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("run result");
    assert!(matches!(
        outcome,
        RunOutcome::Paused(PauseReason::LevelIncomplete { level: 1, .. })
    ));

    // Without force the task stays spent and the run pauses right back.
    let mut handle = Orchestrator::resume_run(bed.config.clone(), &bed.repo.path, "revive", false)
        .await
        .expect("resume_run");
    drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("resume result");
    assert!(matches!(
        outcome,
        RunOutcome::Paused(PauseReason::LevelIncomplete { level: 1, .. })
    ));

    let fixed_config = bed
        .config
        .clone()
        .with_assistant("sh", sh_args(SCRIPTED_ASSISTANT));
    let mut handle = Orchestrator::resume_run(fixed_config.clone(), &bed.repo.path, "revive", true)
        .await
        .expect("forced resume_run");
    drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("forced resume result");

    assert_eq!(outcome, RunOutcome::Completed);
    let state = read_state(&fixed_config, "revive");
    let bad = state.task("bad").unwrap();
    assert_eq!(bad.status, TaskStatus::Complete);
    assert_eq!(bad.retry_count, 0);
}

/// Test: A gate failure is retried on resume with the gate fixed.
///
/// Given: A run paused because a required gate failed after all tasks
///        completed
/// When: It is resumed with a passing gate configuration
/// Then: Only the merge reruns and the level promotes
#[tokio::test(flavor = "multi_thread")]
async fn test_resume_after_gate_failure_reruns_merge() {
    let mut bed = TestBed::new();
    bed.config = bed.config.with_gates(vec![GateConfig::new("lint", "false")]);
    let g = graph(vec![task_creating("solo", 1, &["solo.txt"])]);

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "regate")
        .await
        .expect("start_run");
    drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("run result");
    assert!(matches!(
        outcome,
        RunOutcome::Paused(PauseReason::GateFailure { level: 1, .. })
    ));

    let fixed_config = bed.config.clone().with_gates(Vec::new());
    let mut handle = Orchestrator::resume_run(fixed_config.clone(), &bed.repo.path, "regate", false)
        .await
        .expect("resume_run");
    let events = drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("resume result");

    assert_eq!(outcome, RunOutcome::Completed);
    assert!(bed.repo.show_file("main", "solo.txt").is_some());
    // The task was already complete, so the resumed run merges without
    // claiming anything.
    assert!(!events
        .iter()
        .any(|e| matches!(e, RunEvent::TaskClaimed { .. })));
}

/// Test: Resuming an unknown feature errors instead of inventing state.
#[tokio::test(flavor = "multi_thread")]
async fn test_resume_unknown_feature_errors() {
    let bed = TestBed::new();
    let result = Orchestrator::resume_run(bed.config.clone(), &bed.repo.path, "ghost", false).await;
    assert!(result.is_err());
}

/// Test: The state file parses at every instant of a live run.
///
/// Given: A poller re-reading the state file every few milliseconds
/// When: A two-level run executes underneath it
/// Then: Every read parses cleanly (writes go through a temp file and
///       rename) and no temp file survives the run
#[tokio::test(flavor = "multi_thread")]
async fn test_state_file_always_parses_during_run() {
    let bed = TestBed::new();
    let mut t2 = task_creating("t2", 2, &["two.txt"]);
    t2.dependencies = vec!["t1".to_string()];
    let g = graph(vec![task_creating("t1", 1, &["one.txt"]), t2]);

    let state_path = bed.config.state_path("durable").unwrap();
    let poll_path = state_path.clone();
    let terminated = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&terminated);
    let poller = std::thread::spawn(move || {
        let mut parses = 0u32;
        while !flag.load(Ordering::Relaxed) {
            if let Ok(raw) = std::fs::read_to_string(&poll_path) {
                let _: RunState =
                    serde_json::from_str(&raw).expect("state file should always parse");
                parses += 1;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        parses
    });

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "durable")
        .await
        .expect("start_run");
    drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("run result");
    assert_eq!(outcome, RunOutcome::Completed);

    terminated.store(true, Ordering::Relaxed);
    let parses = poller.join().expect("poller should never panic");
    assert!(parses > 0, "poller should have observed the state file");

    let tmp = format!("{}.tmp", state_path.display());
    assert!(!std::path::Path::new(&tmp).exists());
}
