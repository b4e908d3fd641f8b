//! Quality gates and the shell command runner behind them.
//!
//! Gates run against the staging checkout at a level barrier, in config
//! order. Each gate is a shell command with a timeout; a timeout counts
//! as a failure, and a command that cannot even be spawned counts as a
//! failure too unless the gate is advisory. Task verification commands
//! reuse `run_command`.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::{mlog, mlog_warn};

/// Default quality gate timeout (10 minutes).
pub const DEFAULT_GATE_TIMEOUT_SECS: u64 = 600;

/// How much failing-command output a report keeps.
const DETAIL_LIMIT: usize = 2000;

fn default_gate_timeout() -> u64 {
    DEFAULT_GATE_TIMEOUT_SECS
}

fn default_required() -> bool {
    true
}

/// One configured quality gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    pub name: String,
    pub command: String,
    #[serde(default = "default_gate_timeout")]
    pub timeout_seconds: u64,
    /// Required gates block promotion on failure; advisory ones only warn.
    #[serde(default = "default_required")]
    pub required: bool,
}

impl GateConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout_seconds: DEFAULT_GATE_TIMEOUT_SECS,
            required: true,
        }
    }

    pub fn advisory(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_timeout_seconds(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Raw result of running a shell command with a timeout.
#[derive(Debug, Clone)]
pub enum CommandResult {
    Completed {
        success: bool,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    SpawnFailed(String),
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { success: true, .. })
    }

    /// The most useful failure text: stderr, falling back to stdout.
    pub fn failure_detail(&self) -> String {
        match self {
            Self::Completed { stdout, stderr, .. } => {
                let text = if stderr.is_empty() { stdout } else { stderr };
                tail(text, DETAIL_LIMIT)
            }
            Self::TimedOut => "timed out".to_string(),
            Self::SpawnFailed(e) => e.clone(),
        }
    }
}

/// Run a command through `sh -c` in `cwd`, killing it on timeout.
pub async fn run_command(command: &str, cwd: &Path, timeout: Duration) -> CommandResult {
    let result = tokio::time::timeout(
        timeout,
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .kill_on_drop(true)
            .output(),
    )
    .await;

    match result {
        Err(_) => CommandResult::TimedOut,
        Ok(Err(e)) => CommandResult::SpawnFailed(e.to_string()),
        Ok(Ok(output)) => CommandResult::Completed {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Pass,
    Fail,
    Timeout,
    Error,
}

impl GateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateOutcome::Pass => "pass",
            GateOutcome::Fail => "fail",
            GateOutcome::Timeout => "timeout",
            GateOutcome::Error => "error",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, GateOutcome::Pass)
    }
}

/// Outcome of one gate run at a level barrier.
#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub name: String,
    pub required: bool,
    pub outcome: GateOutcome,
    pub detail: String,
    pub duration: Duration,
}

impl GateReport {
    /// A required gate that did not pass blocks promotion; advisory
    /// gates never do, whatever happened to them.
    pub fn blocks_promotion(&self) -> bool {
        self.required && !self.outcome.is_pass()
    }
}

/// Runs the configured gates in order against a checkout.
pub struct GateRunner {
    gates: Vec<GateConfig>,
}

impl GateRunner {
    pub fn new(gates: Vec<GateConfig>) -> Self {
        Self { gates }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(config.gates.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Run every gate, in order, collecting one report each. Gates keep
    /// running after a failure so the operator sees the full picture.
    pub async fn run_all(&self, cwd: &Path) -> Vec<GateReport> {
        let mut reports = Vec::with_capacity(self.gates.len());
        for gate in &self.gates {
            let started = Instant::now();
            let result = run_command(&gate.command, cwd, gate.timeout()).await;
            let report = Self::report_for(gate, result, started.elapsed());
            match (report.outcome.is_pass(), report.required) {
                (true, _) => mlog!("Gate '{}' passed ({:?})", report.name, report.duration),
                (false, true) => mlog_warn!(
                    "Gate '{}' {}: {}",
                    report.name,
                    report.outcome.as_str(),
                    report.detail
                ),
                (false, false) => mlog_warn!(
                    "Advisory gate '{}' {} (not blocking)",
                    report.name,
                    report.outcome.as_str()
                ),
            }
            reports.push(report);
        }
        reports
    }

    fn report_for(gate: &GateConfig, result: CommandResult, duration: Duration) -> GateReport {
        let (outcome, detail) = match &result {
            CommandResult::Completed { success: true, .. } => (GateOutcome::Pass, String::new()),
            CommandResult::Completed { success: false, .. } => {
                (GateOutcome::Fail, result.failure_detail())
            }
            CommandResult::TimedOut => (
                GateOutcome::Timeout,
                format!("timed out after {}s", gate.timeout_seconds),
            ),
            CommandResult::SpawnFailed(e) => (GateOutcome::Error, e.clone()),
        };
        GateReport {
            name: gate.name.clone(),
            required: gate.required,
            outcome,
            detail,
            duration,
        }
    }
}

/// Last `max` bytes of `s`, on a char boundary.
fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
