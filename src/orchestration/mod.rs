//! Orchestration layer for a feature run.
//!
//! This module coordinates the moving parts of a run: dependency-aware
//! task claiming, worker supervision and crash recovery, quality gates,
//! the level-barrier merge protocol, and the top-level run loop that ties
//! them together.

pub mod claim;
pub mod gates;
pub mod merge;
pub mod orchestrator;
pub mod supervisor;
pub mod worker;

pub use claim::{claim_next, claimable_tasks, is_claimable, level_settled, propagate_blocked};
pub use gates::{CommandResult, GateConfig, GateOutcome, GateReport, GateRunner};
pub use merge::{LevelMerge, MergeCoordinator};
pub use orchestrator::{Orchestrator, PauseReason, RunEvent, RunHandle, RunOutcome};
pub use supervisor::{Recovery, WorkerSupervisor};
pub use worker::{AssistantOutcome, AssistantRunner, Worker, WorkerApi, WorkerExit};
