use thiserror::Error;

use crate::core::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Duplicate task: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Cyclic dependency: {}", format_cycle(.path))]
    CyclicDependency { path: Vec<TaskId> },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Allocation already assigned for task {0}")]
    AllocationAlreadySet(TaskId),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Checkpoint not found for session {0}")]
    CheckpointNotFound(String),

    #[error("Session {0} is locked by another orchestrator")]
    SessionLocked(String),

    #[error("Unsupported state version {found} (expected {expected})")]
    UnsupportedStateVersion { found: u32, expected: u32 },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl Error {
    /// Structural errors are detected before any budget is spent and make the
    /// session refuse to start.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::DuplicateTask(_)
                | Error::UnknownDependency { .. }
                | Error::CyclicDependency { .. }
                | Error::InvalidInput(_)
        )
    }
}

fn format_cycle(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
