//! End-to-end runs: full orchestrations from `start_run` to a terminal
//! outcome against real repositories and worktrees.

use maestro::orchestration::{Orchestrator, PauseReason, RunEvent, RunOutcome};
use maestro::state::TaskStatus;

use crate::fixtures::{
    drain_events, graph, index_of, read_state, sh_args, task, task_creating, task_modifying,
    TestBed, SCRIPTED_ASSISTANT,
};

/// Test: A two-level graph runs to completion with the merged work on main.
///
/// Given: t1 and t2 at level 1 creating a.py and b.py, t3 at level 2
///        depending on both and modifying a.py
/// When: The run executes with two workers
/// Then: Level 1 merges before level 2 starts, the run completes, and
///       main carries all three tasks' file changes
#[tokio::test(flavor = "multi_thread")]
async fn test_two_level_run_completes() {
    let bed = TestBed::new();
    let g = graph(vec![
        task_creating("t1", 1, &["a.py"]),
        task_creating("t2", 1, &["b.py"]),
        task_modifying("t3", 2, &["t1", "t2"], &["a.py"]),
    ]);

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "payments")
        .await
        .expect("start_run");
    let events = drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("run result");

    assert_eq!(outcome, RunOutcome::Completed);

    assert_eq!(
        events.first(),
        Some(&RunEvent::LevelStarted { level: 1, tasks: 2 })
    );
    let t1_done = index_of(&events, |e| {
        matches!(e, RunEvent::TaskCompleted { task_id, .. } if task_id == "t1")
    });
    let t2_done = index_of(&events, |e| {
        matches!(e, RunEvent::TaskCompleted { task_id, .. } if task_id == "t2")
    });
    let merge_1 = index_of(&events, |e| matches!(e, RunEvent::MergeStarted { level: 1 }));
    let merged_1 = index_of(&events, |e| matches!(e, RunEvent::LevelMerged { level: 1, .. }));
    let level_2 = index_of(&events, |e| {
        matches!(e, RunEvent::LevelStarted { level: 2, tasks: 1 })
    });
    let t3_done = index_of(&events, |e| {
        matches!(e, RunEvent::TaskCompleted { task_id, .. } if task_id == "t3")
    });
    assert!(merge_1 > t1_done && merge_1 > t2_done);
    assert!(merged_1 > merge_1);
    assert!(level_2 > merged_1);
    assert!(t3_done > level_2);
    assert_eq!(events.last(), Some(&RunEvent::RunCompleted { levels: 2 }));

    let a = bed.repo.show_file("main", "a.py").expect("a.py on main");
    assert!(a.contains("created by t1"));
    assert!(a.contains("modified by t3"));
    let b = bed.repo.show_file("main", "b.py").expect("b.py on main");
    assert!(b.contains("created by t2"));

    let state = read_state(&bed.config, "payments");
    assert!(state.all_levels_complete());
    assert_eq!(state.progress(), (3, 3));
    for id in ["t1", "t2", "t3"] {
        assert_eq!(state.task(id).unwrap().status, TaskStatus::Complete);
    }
}

/// Test: Tasks in a later level see files promoted by the previous level.
///
/// Given: t1 at level 1 creating lib/core.py, t2 at level 2 whose
///        verification is `test -f lib/core.py`
/// When: The run executes
/// Then: t2's verification passes inside its worktree, proving worker
///       branches were re-seated on the promoted base
#[tokio::test(flavor = "multi_thread")]
async fn test_later_level_sees_promoted_files() {
    let bed = TestBed::new();
    let mut t2 = task("t2", 2);
    t2.dependencies = vec!["t1".to_string()];
    t2.verification.command = "test -f lib/core.py".to_string();
    let g = graph(vec![task_creating("t1", 1, &["lib/core.py"]), t2]);

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "visibility")
        .await
        .expect("start_run");
    drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("run result");

    assert_eq!(outcome, RunOutcome::Completed);
    assert!(bed.repo.show_file("main", "lib/core.py").is_some());
}

/// Test: A task that fails past its retry budget pauses the run.
///
/// Given: One healthy task and one whose assistant always exits nonzero
/// When: The failing task exhausts max_retries
/// Then: The run pauses with LevelIncomplete naming the failed task, the
///       healthy task stays complete, and main is untouched
#[tokio::test(flavor = "multi_thread")]
async fn test_permanent_failure_pauses_run() {
    let mut bed = TestBed::new();
    let script = format!(
        "if [ \"$MAESTRO_TASK_ID\" = bad ]; then echo boom >&2; exit 1; fi\n{SCRIPTED_ASSISTANT}"
    );
    bed.config = bed.config.with_assistant("sh", sh_args(&script));
    let g = graph(vec![task_creating("ok", 1, &["ok.py"]), task("bad", 1)]);
    let max_retries = bed.config.max_retries;

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "authz")
        .await
        .expect("start_run");
    let events = drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("run result");

    match outcome {
        RunOutcome::Paused(PauseReason::LevelIncomplete { level, unfinished }) => {
            assert_eq!(level, 1);
            assert_eq!(unfinished, vec!["bad".to_string()]);
        }
        other => panic!("Expected LevelIncomplete pause, got {other:?}"),
    }

    let failures: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TaskFailed {
                task_id,
                retry_count,
                ..
            } if task_id == "bad" => Some(*retry_count),
            _ => None,
        })
        .collect();
    assert_eq!(failures, (1..=max_retries).collect::<Vec<u32>>());
    assert!(events
        .iter()
        .any(|e| matches!(e, RunEvent::RunPaused { .. })));

    let state = read_state(&bed.config, "authz");
    let bad = state.task("bad").unwrap();
    assert_eq!(bad.status, TaskStatus::Failed);
    assert_eq!(bad.retry_count, max_retries);
    assert!(bad.last_error.as_deref().unwrap_or("").contains("boom"));
    assert_eq!(state.task("ok").unwrap().status, TaskStatus::Complete);

    // The level never merged, so the healthy task's file never landed.
    assert!(bed.repo.show_file("main", "ok.py").is_none());
}

/// Test: A transient failure is retried and the retry succeeds.
///
/// Given: An assistant that fails its first invocation and succeeds after
///        (tracked through a marker file outside the worktree)
/// When: The run executes with zero retry backoff
/// Then: The run completes with the task recording exactly one retry
#[tokio::test(flavor = "multi_thread")]
async fn test_transient_failure_retries_then_succeeds() {
    let mut bed = TestBed::new();
    let marker = bed.maestro_root.path().join("first-attempt");
    let script = format!(
        "if [ ! -f {marker} ]; then touch {marker}; echo transient >&2; exit 1; fi\n{SCRIPTED_ASSISTANT}",
        marker = marker.display()
    );
    bed.config = bed.config.with_assistant("sh", sh_args(&script));
    let g = graph(vec![task_creating("flaky", 1, &["out.py"])]);

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "flaky-run")
        .await
        .expect("start_run");
    let events = drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("run result");

    assert_eq!(outcome, RunOutcome::Completed);
    let failures = events
        .iter()
        .filter(|e| matches!(e, RunEvent::TaskFailed { .. }))
        .count();
    assert_eq!(failures, 1);

    let state = read_state(&bed.config, "flaky-run");
    let flaky = state.task("flaky").unwrap();
    assert_eq!(flaky.status, TaskStatus::Complete);
    assert_eq!(flaky.retry_count, 1);
    assert!(bed.repo.show_file("main", "out.py").is_some());
}

/// Test: Completion removes every run-scoped branch and worktree.
///
/// Given: A single-task run
/// When: It completes
/// Then: Worker and staging branches are gone, worktree directories are
///       gone, and the state file survives as a record
#[tokio::test(flavor = "multi_thread")]
async fn test_completion_cleans_up_branches_and_worktrees() {
    let bed = TestBed::new();
    let g = graph(vec![task_creating("solo", 1, &["solo.py"])]);

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "cleanup")
        .await
        .expect("start_run");
    drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("run result");
    assert_eq!(outcome, RunOutcome::Completed);

    for worker_id in 0..bed.config.workers {
        assert!(!bed
            .repo
            .branch_exists(&format!("maestro/cleanup/worker-{worker_id}")));
    }
    assert!(!bed.repo.branch_exists("maestro/staging/cleanup-L1"));
    let worktrees = bed.config.worktrees_dir("cleanup").unwrap();
    for worker_id in 0..bed.config.workers {
        assert!(!worktrees.join(format!("worker-{worker_id}")).exists());
    }
    assert!(bed.config.state_path("cleanup").unwrap().exists());
}

/// Test: Starting a run for a feature that already has state is refused.
///
/// Given: A completed run for a feature
/// When: start_run is called again for the same feature
/// Then: It errors instead of clobbering the record
#[tokio::test(flavor = "multi_thread")]
async fn test_start_refuses_existing_feature_state() {
    let bed = TestBed::new();
    let g = graph(vec![task_creating("solo", 1, &["solo.py"])]);

    let mut handle =
        Orchestrator::start_run(g.clone(), bed.config.clone(), &bed.repo.path, "dup")
            .await
            .expect("start_run");
    drain_events(&mut handle).await;
    handle.wait().await.expect("run result");

    let result = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "dup").await;
    assert!(result.is_err());
}
