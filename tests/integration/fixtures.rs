//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Temporary git repositories with a `main` branch
//! - Programmatic task graph construction
//! - Configs pointing every maestro path into a scratch directory
//! - Shell stand-ins for the coding assistant

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;

use maestro::config::Config;
use maestro::graph::{TaskGraph, TaskSpec, Verification};
use maestro::orchestration::{RunEvent, RunHandle};
use maestro::policy::BackoffStrategy;
use maestro::state::RunState;

/// Stand-in assistant: creates every file in `MAESTRO_TASK_CREATE` and
/// appends to every file in `MAESTRO_TASK_MODIFY`, like a well-behaved
/// assistant honoring its declared file lists.
pub const SCRIPTED_ASSISTANT: &str = r#"set -e
IFS=','
for f in $MAESTRO_TASK_CREATE; do
  [ -n "$f" ] || continue
  d=$(dirname "$f")
  mkdir -p "$d"
  printf '// created by %s\n' "$MAESTRO_TASK_ID" > "$f"
done
for f in $MAESTRO_TASK_MODIFY; do
  [ -n "$f" ] || continue
  printf '// modified by %s\n' "$MAESTRO_TASK_ID" >> "$f"
done
"#;

/// Argument vector that runs `script` through `sh -c`.
pub fn sh_args(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository on `main` with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        Command::new("git")
            .args(["init", "-b", "main"])
            .current_dir(&path)
            .output()
            .expect("Failed to init git");

        Command::new("git")
            .args(["config", "user.email", "test@test.com"])
            .current_dir(&path)
            .output()
            .expect("Failed to set user.email");

        Command::new("git")
            .args(["config", "user.name", "Test User"])
            .current_dir(&path)
            .output()
            .expect("Failed to set user.name");

        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");

        Command::new("git")
            .args(["add", "."])
            .current_dir(&path)
            .output()
            .expect("Failed to git add");

        Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(&path)
            .output()
            .expect("Failed to git commit");

        Self { temp_dir, path }
    }

    /// Commit id a branch currently points at.
    pub fn branch_commit(&self, branch: &str) -> String {
        let output = Command::new("git")
            .args(["rev-parse", branch])
            .current_dir(&self.path)
            .output()
            .expect("Failed to rev-parse");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Check if a branch exists.
    pub fn branch_exists(&self, name: &str) -> bool {
        let output = Command::new("git")
            .args(["branch", "--list", name])
            .current_dir(&self.path)
            .output()
            .expect("Failed to list branches");

        !String::from_utf8_lossy(&output.stdout).trim().is_empty()
    }

    /// Contents of `path` as committed on `branch`, if the file exists
    /// there.
    pub fn show_file(&self, branch: &str, path: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["show", &format!("{branch}:{path}")])
            .current_dir(&self.path)
            .output()
            .ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            None
        }
    }

    /// Subject line of the last commit on `branch`.
    pub fn last_commit_message(&self, branch: &str) -> String {
        let output = Command::new("git")
            .args(["log", "-1", "--format=%s", branch])
            .current_dir(&self.path)
            .output()
            .expect("Failed to read log");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one runtime test needs: a git repo to orchestrate, a
/// scratch maestro root for state and worktrees, and a config wired to
/// both with test-friendly timings.
pub struct TestBed {
    pub repo: TestRepo,
    pub maestro_root: TempDir,
    pub config: Config,
}

impl TestBed {
    /// A bed with the scripted assistant, two workers, a 50ms poll
    /// interval, and zero-delay retries.
    pub fn new() -> Self {
        let repo = TestRepo::new();
        let maestro_root = TempDir::new().expect("Failed to create maestro root");
        let config = Config::default()
            .with_root(maestro_root.path().to_str().expect("utf-8 temp path"))
            .with_workers(2)
            .with_poll_interval_ms(50)
            .with_backoff(BackoffStrategy::Fixed, 0, 0)
            .with_assistant("sh", sh_args(SCRIPTED_ASSISTANT));
        Self {
            repo,
            maestro_root,
            config,
        }
    }
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a task spec with a `true` verification.
pub fn task(id: &str, level: u32) -> TaskSpec {
    TaskSpec {
        id: id.to_string(),
        title: format!("{id} task"),
        level,
        dependencies: Vec::new(),
        files: Default::default(),
        verification: Verification {
            command: "true".to_string(),
            timeout_seconds: 60,
        },
    }
}

/// A task that declares files in its `create` set.
pub fn task_creating(id: &str, level: u32, files: &[&str]) -> TaskSpec {
    let mut spec = task(id, level);
    spec.files.create = files.iter().map(|s| s.to_string()).collect();
    spec
}

/// A task with dependencies and files in its `modify` set.
pub fn task_modifying(id: &str, level: u32, deps: &[&str], files: &[&str]) -> TaskSpec {
    let mut spec = task(id, level);
    spec.dependencies = deps.iter().map(|s| s.to_string()).collect();
    spec.files.modify = files.iter().map(|s| s.to_string()).collect();
    spec
}

/// Validate specs into a graph, panicking on a malformed fixture.
pub fn graph(specs: Vec<TaskSpec>) -> TaskGraph {
    TaskGraph::from_specs(specs).expect("fixture graph should validate")
}

/// Parse the persisted state document for `feature`.
pub fn read_state(config: &Config, feature: &str) -> RunState {
    let path = config.state_path(feature).expect("state path");
    let raw = std::fs::read_to_string(path).expect("state file should exist");
    serde_json::from_str(&raw).expect("state file should parse")
}

/// Drain the event stream until the orchestrator closes it.
pub async fn drain_events(handle: &mut RunHandle) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Some(ev) = handle.next_event().await {
        events.push(ev);
    }
    events
}

/// Pump events until one matches `pred`, returning it. Panics if the
/// stream closes or 30 seconds pass first.
pub async fn wait_for<F>(handle: &mut RunHandle, pred: F) -> RunEvent
where
    F: Fn(&RunEvent) -> bool,
{
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(30), handle.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed before the expected event");
        if pred(&ev) {
            return ev;
        }
    }
}

/// Position of the first event matching `pred`, for ordering assertions.
pub fn index_of<F>(events: &[RunEvent], pred: F) -> usize
where
    F: Fn(&RunEvent) -> bool,
{
    events
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("expected event not found in {events:#?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_repo_starts_on_main() {
        let repo = TestRepo::new();
        assert!(repo.path.join(".git").exists());
        assert!(repo.branch_exists("main"));
        assert!(repo.show_file("main", "README.md").is_some());
    }

    #[test]
    fn test_task_builders_validate() {
        let g = graph(vec![
            task_creating("t1", 1, &["a.py"]),
            task_creating("t2", 1, &["b.py"]),
            task_modifying("t3", 2, &["t1", "t2"], &["a.py"]),
        ]);
        assert_eq!(g.len(), 3);
        assert_eq!(g.levels(), vec![1, 2]);
    }

    #[test]
    fn test_same_level_modify_overlap_is_rejected() {
        let result = TaskGraph::from_specs(vec![
            task_modifying("a", 1, &[], &["src/x.py"]),
            task_modifying("b", 1, &[], &["src/x.py"]),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bed_paths_live_under_scratch_root() {
        let bed = TestBed::new();
        let state = bed.config.state_path("feat").unwrap();
        assert!(state.starts_with(bed.maestro_root.path()));
    }
}
