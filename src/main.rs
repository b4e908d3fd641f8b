use std::path::PathBuf;

use clap::{Parser, Subcommand};

use maestro::config::Config;
use maestro::graph::TaskGraph;
use maestro::orchestration::{Orchestrator, RunEvent, RunHandle, RunOutcome};
use maestro::state::{LevelStatus, MergeStatus, RunState, StateStore, TaskStatus, WorkerStatus};
use maestro::{mlog, Error, Result};

/// Maestro - parallel task-graph executor for AI coding assistants
#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MAESTRO_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.maestro/maestro.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a task graph as a new feature run
    Run {
        /// Path to the task graph JSON file
        graph: PathBuf,

        /// Feature name, used for the state file, branches and worktrees
        #[arg(long, short = 'f')]
        feature: String,

        /// Number of parallel workers (overrides config)
        #[arg(long)]
        workers: Option<usize>,

        /// Branch levels are merged into (overrides config)
        #[arg(long)]
        base_branch: Option<String>,
    },

    /// Resume an interrupted or paused run from its state file
    Resume {
        /// Feature name of the run to resume
        feature: String,

        /// Also revive tasks that exhausted their retry budget
        #[arg(long)]
        force: bool,
    },

    /// Show the current state of a feature run
    Status {
        /// Feature name of the run
        feature: String,

        /// Emit machine-readable JSON instead of the table
        #[arg(long)]
        json: bool,
    },

    /// Check a task graph file without running it
    Validate {
        /// Path to the task graph JSON file
        graph: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on debug flag
    maestro::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Run {
            graph,
            feature,
            workers,
            base_branch,
        } => run_graph(graph, feature, workers, base_branch),
        Command::Resume { feature, force } => resume(feature, force),
        Command::Status { feature, json } => show_status(feature, json),
        Command::Validate { graph } => validate(graph),
    }
}

/// Start a fresh run: load the graph, spin up the orchestrator, and pump
/// events to the terminal until the run finishes or is stopped.
fn run_graph(
    graph_path: PathBuf,
    feature: String,
    workers: Option<usize>,
    base_branch: Option<String>,
) -> Result<()> {
    mlog!(
        "Run command: graph={:?}, feature={}, workers={:?}",
        graph_path,
        feature,
        workers
    );

    let graph = TaskGraph::load(&graph_path)?;
    let mut config = Config::load()?;
    if let Some(n) = workers {
        config.workers = n;
    }
    if let Some(branch) = base_branch {
        config.base_branch = branch;
    }

    let repo_path = std::env::current_dir()?;

    println!("Starting run '{}'", feature);
    println!("  Repository: {}", repo_path.display());
    println!(
        "  Tasks:      {} across {} level(s)",
        graph.len(),
        graph.levels().len()
    );
    println!("  Workers:    {}", config.workers);
    println!();

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        let handle = Orchestrator::start_run(graph, config, &repo_path, &feature).await?;
        drive(handle).await
    })?;

    report_outcome(&feature, outcome);
    Ok(())
}

/// Resume a run from its state file. In-flight tasks from the previous
/// process are requeued without spending retry budget; `--force` also
/// revives tasks that ran out of retries.
fn resume(feature: String, force: bool) -> Result<()> {
    mlog!("Resume command: feature={}, force={}", feature, force);

    let config = Config::load()?;
    let repo_path = std::env::current_dir()?;

    println!("Resuming run '{}'", feature);
    println!();

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        let handle = Orchestrator::resume_run(config, &repo_path, &feature, force).await?;
        drive(handle).await
    })?;

    report_outcome(&feature, outcome);
    Ok(())
}

/// Pump run events to the terminal until the orchestrator closes the
/// stream. The first Ctrl-C asks for a graceful stop (workers commit
/// checkpoints and release their tasks); a second Ctrl-C forces.
async fn drive(mut handle: RunHandle) -> Result<RunOutcome> {
    let mut interrupts: u32 = 0;
    loop {
        tokio::select! {
            ev = handle.next_event() => match ev {
                Some(ev) => print_event(&ev),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts == 1 {
                    println!();
                    println!("\x1b[33mStopping gracefully... press Ctrl-C again to force\x1b[0m");
                    Orchestrator::stop_run(&handle, true);
                } else {
                    println!("\x1b[31mForcing stop, uncommitted work is abandoned\x1b[0m");
                    Orchestrator::stop_run(&handle, false);
                }
            }
        }
    }
    handle.wait().await
}

fn print_event(ev: &RunEvent) {
    match ev {
        RunEvent::LevelStarted { level, tasks } => {
            println!("\x1b[36m==> Level {}\x1b[0m ({} task(s))", level, tasks);
        }
        RunEvent::TaskClaimed { task_id, worker_id } => {
            println!("    worker {} picked up {}", worker_id, task_id);
        }
        RunEvent::TaskCompleted { task_id, worker_id } => {
            println!("    \x1b[32m✓\x1b[0m {} (worker {})", task_id, worker_id);
        }
        RunEvent::TaskFailed {
            task_id,
            retry_count,
            error,
            ..
        } => {
            println!(
                "    \x1b[31m✗\x1b[0m {} (attempt {}): {}",
                task_id,
                retry_count,
                truncate_string(error, 60)
            );
        }
        RunEvent::TaskBlocked { task_id, reason } => {
            println!("    \x1b[35m•\x1b[0m {} blocked: {}", task_id, reason);
        }
        RunEvent::WorkerCrashed {
            worker_id,
            requeued_task,
            respawned,
        } => {
            let task = requeued_task.as_deref().unwrap_or("no task");
            let fate = if *respawned {
                "respawning"
            } else {
                "respawn budget exhausted"
            };
            println!(
                "    \x1b[33m!\x1b[0m worker {} crashed ({}; {})",
                worker_id, task, fate
            );
        }
        RunEvent::MergeStarted { level } => {
            println!("\x1b[36m==> Merging level {}\x1b[0m", level);
        }
        RunEvent::LevelMerged { level, commit } => {
            println!(
                "    \x1b[32m✓\x1b[0m level {} promoted at {}",
                level,
                &commit[..8.min(commit.len())]
            );
        }
        RunEvent::RunPaused { reason } => {
            println!("\x1b[33mRun paused: {}\x1b[0m", reason);
        }
        RunEvent::RunCompleted { levels } => {
            println!("\x1b[32mAll {} level(s) merged\x1b[0m", levels);
        }
    }
}

fn report_outcome(feature: &str, outcome: RunOutcome) {
    println!();
    match outcome {
        RunOutcome::Completed => {
            println!("\x1b[32mRun '{}' completed.\x1b[0m", feature);
        }
        RunOutcome::Paused(reason) => {
            println!("\x1b[33mRun '{}' paused:\x1b[0m {}", feature, reason);
            println!();
            println!("Fix the underlying problem, then: maestro resume {}", feature);
            println!("Add --force to also retry tasks that are out of retries.");
        }
        RunOutcome::Stopped => {
            println!(
                "Run '{}' stopped. Resume with: maestro resume {}",
                feature, feature
            );
        }
    }
}

/// Read the persisted state document for a feature. Status is a
/// read-only peek, so it skips the store and its run lock entirely.
fn load_state(config: &Config, feature: &str) -> Result<RunState> {
    let path = config.state_path(feature)?;
    if !StateStore::exists(&path) {
        return Err(Error::RunNotFound(feature.to_string()));
    }
    let raw = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Show the status of a run: levels, tasks, workers, progress.
fn show_status(feature: String, json: bool) -> Result<()> {
    mlog!("Status command: feature={}, json={}", feature, json);

    let config = Config::load()?;
    let state = load_state(&config, &feature)?;
    let (done, total) = state.progress();

    if json {
        let out = serde_json::json!({
            "feature": state.feature,
            "run_id": state.run_id.to_string(),
            "started_at": state.started_at.to_rfc3339(),
            "current_level": state.current_level,
            "progress": { "complete": done, "total": total },
            "levels": state.levels.values().map(|l| serde_json::json!({
                "level": l.level_number,
                "status": l.status,
                "merge_status": l.merge_status,
            })).collect::<Vec<_>>(),
            "tasks": state.tasks.values().map(|t| serde_json::json!({
                "id": t.id,
                "level": t.level,
                "status": t.status,
                "retry_count": t.retry_count,
                "worker_id": t.worker_id,
                "last_error": t.last_error,
            })).collect::<Vec<_>>(),
            "workers": state.workers.values().map(|w| serde_json::json!({
                "worker_id": w.worker_id,
                "status": w.status,
                "current_task": w.current_task,
                "progress_pct": w.progress_pct,
                "respawns": w.respawns,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                         Run Status                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("  Feature:       {}", state.feature);
    println!("  Run ID:        {}", state.short_run_id());
    println!(
        "  Started:       {}",
        state.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  Current level: {}", state.current_level);
    println!("  Progress:      {}/{} task(s) complete", done, total);
    println!();

    println!("  Levels:");
    for level in state.levels.values() {
        println!(
            "    {}  {:<9} merge {}",
            level.level_number,
            level_label(level.status),
            merge_label(level.merge_status)
        );
    }
    println!();

    println!("  Tasks:");
    for task in state.tasks.values() {
        print!(
            "    {}{:<13}\x1b[0m {:<24} L{}",
            task_color(task.status),
            task.status.as_str(),
            task.id,
            task.level
        );
        if task.retry_count > 0 {
            print!("  retries {}", task.retry_count);
        }
        if task.status == TaskStatus::Failed {
            if let Some(error) = &task.last_error {
                print!("  {}", truncate_string(error, 40));
            }
        }
        if let Some(reason) = &task.blocked_reason {
            print!("  {}", truncate_string(reason, 40));
        }
        println!();
    }
    println!();

    println!("  Workers:");
    for worker in state.workers.values() {
        let task = worker.current_task.as_deref().unwrap_or("-");
        let pct = worker
            .progress_pct
            .map(|p| format!("{}%", p))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "    {}  {}{:<11}\x1b[0m {:<24} {}",
            worker.worker_id,
            worker_color(worker.status),
            worker.status.as_str(),
            task,
            pct
        );
    }

    Ok(())
}

/// Check a task graph without touching the repository: parses the file
/// and runs the same validation the orchestrator runs at start.
fn validate(graph_path: PathBuf) -> Result<()> {
    mlog!("Validate command: graph={:?}", graph_path);

    let graph = TaskGraph::load(&graph_path)?;

    println!(
        "\x1b[32mOK\x1b[0m {} task(s) across {} level(s)",
        graph.len(),
        graph.levels().len()
    );
    for level in graph.levels() {
        let ids: Vec<&str> = graph
            .tasks_at_level(level)
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        println!("  level {}: {}", level, ids.join(", "));
    }

    Ok(())
}

/// ANSI color for a task status cell.
fn task_color(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Complete => "\x1b[32m",
        TaskStatus::Failed | TaskStatus::WorkerCrash => "\x1b[31m",
        TaskStatus::Claimed | TaskStatus::InProgress | TaskStatus::Verifying => "\x1b[33m",
        TaskStatus::Blocked => "\x1b[35m",
        TaskStatus::Pending => "\x1b[90m",
    }
}

fn worker_color(status: WorkerStatus) -> &'static str {
    match status {
        WorkerStatus::Running | WorkerStatus::Verifying => "\x1b[33m",
        WorkerStatus::Crashed => "\x1b[31m",
        WorkerStatus::Idle => "\x1b[32m",
        WorkerStatus::Checkpoint | WorkerStatus::Stopped => "\x1b[90m",
    }
}

fn level_label(status: LevelStatus) -> &'static str {
    match status {
        LevelStatus::Pending => "pending",
        LevelStatus::Running => "running",
        LevelStatus::Complete => "complete",
    }
}

fn merge_label(status: MergeStatus) -> &'static str {
    match status {
        MergeStatus::Pending => "pending",
        MergeStatus::InProgress => "in progress",
        MergeStatus::Complete => "done",
        MergeStatus::Failed => "failed",
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}
