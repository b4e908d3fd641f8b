pub mod config;
pub mod error;
pub mod git;
pub mod graph;
pub mod log;
pub mod orchestration;
pub mod policy;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};
pub use git::GitOps;
pub use graph::{TaskGraph, TaskSpec};
pub use orchestration::{Orchestrator, PauseReason, RunEvent, RunHandle, RunOutcome};
pub use state::{RunState, StateStore, TaskStatus};
