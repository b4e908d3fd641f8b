use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Task graph validation failed: {0}")]
    GraphValidation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(u32),

    #[error("Task {task_id} is held by worker {held_by}, claim by worker {claimed_by} is an invariant violation")]
    ClaimConflict {
        task_id: String,
        held_by: u32,
        claimed_by: u32,
    },

    #[error("Invalid task transition for {task_id}: {from} -> {to}")]
    InvalidTaskTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Worker {worker_id} does not own task {task_id}")]
    NotTaskOwner { task_id: String, worker_id: u32 },

    #[error("Assistant binary not found (configure assistant_bin or install it on PATH)")]
    AssistantBinaryNotFound,

    #[error("Run already exists for feature: {0}")]
    RunExists(String),

    #[error("No run found for feature: {0}")]
    RunNotFound(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
