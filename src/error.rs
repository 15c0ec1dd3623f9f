use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::TaskId;
use crate::orchestration::WorkerId;

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

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Dependency {blocker} -> {dependent} would create a cycle")]
    DependencyCycle { blocker: TaskId, dependent: TaskId },

    #[error("Claim conflict: task {task} is not owned by {worker}")]
    ClaimConflict { task: TaskId, worker: WorkerId },

    #[error("Worker timed out on task {task} after {after:?}")]
    WorkerTimeout { task: TaskId, after: Duration },

    #[error("Checkpoint precondition failed: {0}")]
    CheckpointPrecondition(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Task {task} cannot be resolved: {reason}")]
    Unresolvable { task: TaskId, reason: String },

    #[error("Gate {gate} escalated after {attempts} attempts")]
    GateEscalated { gate: String, attempts: u32 },

    #[error("Corrupt session state: {0}")]
    CorruptState(String),

    #[error("Unsupported session state version {found} (expected {expected})")]
    UnsupportedStateVersion { found: u32, expected: u32 },

    #[error("No session found in {0}")]
    NoSession(PathBuf),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Worker pool is full (max: {max})")]
    WorkerPoolFull { max: usize },

    #[error("Worker not found: {id}")]
    WorkerNotFound { id: WorkerId },

    #[error("Maximum iterations reached ({0})")]
    MaxIterations(u32),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Ref not found: {0}")]
    RefNotFound(String),
}

impl Error {
    /// Errors that halt the whole session rather than a single task.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::ClaimConflict { .. }
                | Error::CorruptState(_)
                | Error::UnsupportedStateVersion { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
