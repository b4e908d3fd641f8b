//! Claim ordering and the level barrier: who may run what, and when a
//! level's work becomes visible to the next.

use std::sync::Arc;

use maestro::orchestration::{claim_next, Orchestrator, PauseReason, RunEvent, RunOutcome};
use maestro::state::{RunState, StateStore, TaskStatus, WorkerState};

use crate::fixtures::{
    drain_events, graph, index_of, read_state, sh_args, task, task_creating, TestBed,
    SCRIPTED_ASSISTANT,
};

/// Test: A single worker claims tasks in ascending id order.
///
/// Given: Three independent level-1 tasks named alpha, beta, gamma
/// When: One worker runs them all
/// Then: The claim events arrive in id order
#[tokio::test(flavor = "multi_thread")]
async fn test_single_worker_claims_in_ascending_id_order() {
    let mut bed = TestBed::new();
    bed.config = bed.config.with_workers(1);
    let g = graph(vec![
        task_creating("alpha", 1, &["a.txt"]),
        task_creating("beta", 1, &["b.txt"]),
        task_creating("gamma", 1, &["c.txt"]),
    ]);

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "ordering")
        .await
        .expect("start_run");
    let events = drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("run result");
    assert_eq!(outcome, RunOutcome::Completed);

    let claims: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TaskClaimed { task_id, .. } => Some(task_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(claims, vec!["alpha", "beta", "gamma"]);
}

/// Test: No task in level 2 is claimed before level 1 has merged.
///
/// Given: Two level-1 tasks and one level-2 task, two workers
/// When: The run executes
/// Then: The level-2 claim event comes strictly after LevelMerged(1),
///       even though a worker sits idle while level 1 finishes
#[tokio::test(flavor = "multi_thread")]
async fn test_no_second_level_claim_before_first_level_merges() {
    let bed = TestBed::new();
    let mut two_a = task("two_a", 2);
    two_a.dependencies = vec!["one_a".to_string()];
    two_a.files.create = ["two.txt".to_string()].into();
    let g = graph(vec![
        task_creating("one_a", 1, &["oa.txt"]),
        task_creating("one_b", 1, &["ob.txt"]),
        two_a,
    ]);

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "barrier")
        .await
        .expect("start_run");
    let events = drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("run result");
    assert_eq!(outcome, RunOutcome::Completed);

    let merged_1 = index_of(&events, |e| matches!(e, RunEvent::LevelMerged { level: 1, .. }));
    let claim_2 = index_of(&events, |e| {
        matches!(e, RunEvent::TaskClaimed { task_id, .. } if task_id == "two_a")
    });
    assert!(
        claim_2 > merged_1,
        "level-2 task claimed at {claim_2} before level 1 merged at {merged_1}"
    );
}

/// Test: Dependents of a task that failed out are blocked, not run.
///
/// Given: A level-1 task that always fails and a level-2 dependent
/// When: The level-1 task exhausts its retries
/// Then: The dependent is blocked with a reason naming the dead
///       dependency, never claimed, and the run pauses on level 1
#[tokio::test(flavor = "multi_thread")]
async fn test_dependents_of_spent_task_are_blocked() {
    let mut bed = TestBed::new();
    let script = format!(
        "if [ \"$MAESTRO_TASK_ID\" = root ]; then echo rotten >&2; exit 1; fi\n{SCRIPTED_ASSISTANT}"
    );
    bed.config = bed.config.with_assistant("sh", sh_args(&script));
    let mut leaf = task("leaf", 2);
    leaf.dependencies = vec!["root".to_string()];
    let g = graph(vec![task("root", 1), leaf]);

    let mut handle = Orchestrator::start_run(g, bed.config.clone(), &bed.repo.path, "blocked")
        .await
        .expect("start_run");
    let events = drain_events(&mut handle).await;
    let outcome = handle.wait().await.expect("run result");

    match outcome {
        RunOutcome::Paused(PauseReason::LevelIncomplete { level, unfinished }) => {
            assert_eq!(level, 1);
            assert_eq!(unfinished, vec!["root".to_string()]);
        }
        other => panic!("Expected LevelIncomplete pause, got {other:?}"),
    }

    let blocked = events.iter().find_map(|e| match e {
        RunEvent::TaskBlocked { task_id, reason } if task_id == "leaf" => Some(reason.clone()),
        _ => None,
    });
    let reason = blocked.expect("leaf should emit TaskBlocked");
    assert!(reason.contains("root"), "reason should name the dead dependency: {reason}");
    assert!(!events
        .iter()
        .any(|e| matches!(e, RunEvent::TaskClaimed { task_id, .. } if task_id == "leaf")));

    let state = read_state(&bed.config, "blocked");
    let leaf = state.task("leaf").unwrap();
    assert_eq!(leaf.status, TaskStatus::Blocked);
    assert!(leaf.blocked_reason.as_deref().unwrap_or("").contains("root"));
}

/// Test: Concurrent claims through the store hand a task to one worker.
///
/// Given: A one-task state shared by eight would-be claimants
/// When: All of them race claim_next through StateStore::mutate
/// Then: Exactly one wins and the rest see nothing claimable
#[tokio::test(flavor = "multi_thread")]
async fn test_claim_is_exclusive_under_concurrent_mutation() {
    let dir = tempfile::TempDir::new().unwrap();
    let g = graph(vec![task("only", 1)]);
    let mut state = RunState::new("race", &g);
    for worker_id in 0..8u32 {
        state.register_worker(WorkerState::new(
            worker_id,
            format!("maestro/race/worker-{worker_id}"),
            dir.path().join(format!("w{worker_id}")),
        ));
    }
    let store = Arc::new(StateStore::init(dir.path().join("race.json"), state).unwrap());

    let mut joins = Vec::new();
    for worker_id in 0..8u32 {
        let store = Arc::clone(&store);
        joins.push(tokio::spawn(async move {
            store.mutate(move |state| claim_next(state, worker_id)).await
        }));
    }

    let mut winners = 0;
    for join in joins {
        match join.await.unwrap().unwrap() {
            Some(task_id) => {
                assert_eq!(task_id, "only");
                winners += 1;
            }
            None => {}
        }
    }
    assert_eq!(winners, 1);

    let state = store.snapshot().await;
    assert_eq!(state.task("only").unwrap().status, TaskStatus::Claimed);
    assert!(state.task("only").unwrap().worker_id.is_some());
}
