//! Persisted run state: the data model and the store that owns the
//! single JSON document per feature run.

pub mod model;
pub mod store;

pub use model::{
    LevelState, LevelStatus, MergeStatus, RunState, TaskState, TaskStatus, WorkerState,
    WorkerStatus,
};
pub use store::StateStore;
