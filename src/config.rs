use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestration::gates::GateConfig;
use crate::policy::BackoffStrategy;
use crate::{mlog_debug, Error, Result};

/// Default number of parallel workers.
pub const DEFAULT_WORKERS: usize = 3;
/// Default integration base branch.
pub const DEFAULT_BASE_BRANCH: &str = "main";
/// Default orchestrator poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
/// Default heartbeat timeout (5 minutes) before a worker counts as dead.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 300;
/// Default retry budget per task (verification failures only).
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default respawn budget per worker slot.
pub const DEFAULT_MAX_RESPAWNS: u32 = 3;
/// Default grace period before declaring all workers blocked.
pub const DEFAULT_BLOCKED_GRACE_SECS: u64 = 30;
/// Default backoff base delay between retries.
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 5;
/// Default backoff cap for the exponential strategy.
pub const DEFAULT_BACKOFF_CAP_SECS: u64 = 300;
/// Default consecutive-failure threshold that opens a circuit breaker.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default breaker cooldown before a half-open trial.
pub const DEFAULT_COOLDOWN_SECS: u64 = 60;
/// Default rolling-window size for the backpressure controller.
pub const DEFAULT_WINDOW_SIZE: usize = 100;
/// Default assistant binary looked up on PATH.
pub const DEFAULT_ASSISTANT_BIN: &str = "claude";
/// Default assistant timeout (10 minutes).
pub const DEFAULT_ASSISTANT_TIMEOUT_SECS: u64 = 600;

/// Runtime configuration for a maestro run.
///
/// Loaded from `~/.maestro/config.toml`; every field has a default so a
/// missing or partial file works. Tests build configs with the `with_*`
/// methods and point `root` at a temp directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of parallel worker harnesses.
    pub workers: usize,
    /// Integration base branch the merge coordinator promotes to.
    pub base_branch: String,
    /// Orchestrator and harness poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Heartbeat timeout in seconds before a worker is considered dead.
    pub heartbeat_timeout_secs: u64,
    /// Per-task retry budget for verification failures.
    pub max_retries: u32,
    /// Per-worker respawn budget after crashes.
    pub max_respawns: u32,
    /// Grace period in seconds before flagging "all workers blocked".
    pub blocked_grace_secs: u64,
    /// Backoff strategy between task retries.
    pub backoff: BackoffStrategy,
    /// Backoff base delay in seconds.
    pub backoff_base_secs: u64,
    /// Backoff cap in seconds (exponential strategy).
    pub backoff_cap_secs: u64,
    /// Consecutive failures before a circuit breaker opens.
    pub failure_threshold: u32,
    /// Breaker cooldown in seconds before a half-open trial.
    pub cooldown_secs: u64,
    /// Rolling window size for the backpressure controller.
    pub window_size: usize,
    /// Assistant binary name (resolved on PATH with `which`).
    pub assistant_bin: String,
    /// Assistant argument template; `{prompt}` is replaced per task.
    pub assistant_args: Vec<String>,
    /// Assistant execution timeout in seconds.
    pub assistant_timeout_secs: u64,
    /// Quality gates run against staging before a level is promoted.
    pub gates: Vec<GateConfig>,
    /// Override for the maestro root directory (default `~/.maestro`).
    pub root: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            base_branch: DEFAULT_BASE_BRANCH.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_respawns: DEFAULT_MAX_RESPAWNS,
            blocked_grace_secs: DEFAULT_BLOCKED_GRACE_SECS,
            backoff: BackoffStrategy::ExponentialCapped,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            backoff_cap_secs: DEFAULT_BACKOFF_CAP_SECS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            window_size: DEFAULT_WINDOW_SIZE,
            assistant_bin: DEFAULT_ASSISTANT_BIN.to_string(),
            assistant_args: vec!["-p".to_string(), "{prompt}".to_string()],
            assistant_timeout_secs: DEFAULT_ASSISTANT_TIMEOUT_SECS,
            gates: Vec::new(),
            root: None,
        }
    }
}

impl Config {
    /// The maestro root directory, `~/.maestro` unless overridden.
    pub fn maestro_dir(&self) -> Result<PathBuf> {
        match &self.root {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".maestro")),
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".maestro")
            .join("config.toml"))
    }

    /// Directory holding one state file per feature.
    pub fn state_dir(&self) -> Result<PathBuf> {
        Ok(self.maestro_dir()?.join("state"))
    }

    /// Canonical state file for a feature run.
    pub fn state_path(&self, feature: &str) -> Result<PathBuf> {
        Ok(self.state_dir()?.join(format!("{}.json", feature)))
    }

    /// Directory holding the per-worker worktrees for a feature run.
    pub fn worktrees_dir(&self, feature: &str) -> Result<PathBuf> {
        Ok(self.maestro_dir()?.join("worktrees").join(feature))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        mlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            mlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        mlog_debug!(
            "Config loaded: workers={}, base_branch={}, gates={}",
            config.workers,
            config.base_branch,
            config.gates.len()
        );
        Ok(config)
    }

    /// Create the root/state/worktree directories for a feature run.
    pub fn ensure_dirs(&self, feature: &str) -> Result<()> {
        let state_dir = self.state_dir()?;
        let worktrees = self.worktrees_dir(feature)?;
        mlog_debug!(
            "Config::ensure_dirs state={} worktrees={}",
            state_dir.display(),
            worktrees.display()
        );
        if !state_dir.exists() {
            fs::create_dir_all(&state_dir)?;
        }
        if !worktrees.exists() {
            fs::create_dir_all(&worktrees)?;
        }
        Ok(())
    }

    // ---- duration accessors ----

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn blocked_grace(&self) -> Duration {
        Duration::from_secs(self.blocked_grace_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn assistant_timeout(&self) -> Duration {
        Duration::from_secs(self.assistant_timeout_secs)
    }

    // ---- builders (used heavily by tests) ----

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_base_branch(mut self, branch: impl Into<String>) -> Self {
        self.base_branch = branch.into();
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_heartbeat_timeout(mut self, secs: u64) -> Self {
        self.heartbeat_timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_respawns(mut self, respawns: u32) -> Self {
        self.max_respawns = respawns;
        self
    }

    pub fn with_backoff(mut self, strategy: BackoffStrategy, base_secs: u64, cap_secs: u64) -> Self {
        self.backoff = strategy;
        self.backoff_base_secs = base_secs;
        self.backoff_cap_secs = cap_secs;
        self
    }

    pub fn with_assistant(mut self, bin: impl Into<String>, args: Vec<String>) -> Self {
        self.assistant_bin = bin.into();
        self.assistant_args = args;
        self
    }

    pub fn with_gates(mut self, gates: Vec<GateConfig>) -> Self {
        self.gates = gates;
        self
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
