// src/errors.rs

//! Crate-wide error type and helpers.

use thiserror::Error;

use crate::types::{TaskId, TaskStatus};

/// A compact description of a task, carried inside `InUse` payloads so a
/// caller can see exactly which tasks block an environment mutation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TaskRef {
    pub task_id: TaskId,
    pub task_name: String,
}

#[derive(Error, Debug)]
pub enum TaskforgeError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("execution {execution_id} not found for task {task_id}")]
    ExecutionNotFound {
        task_id: TaskId,
        execution_id: uuid::Uuid,
    },

    #[error("environment '{0}' not found")]
    EnvMissing(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("cannot {action} a task with status '{current}'")]
    IllegalState {
        action: &'static str,
        current: TaskStatus,
    },

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("environment '{name}' is in use by {} task(s)", .referencing.len())]
    InUse { name: String, referencing: Vec<TaskRef> },

    #[error("packages not found: {}", .missing.join(", "))]
    PackageNotFound { missing: Vec<String> },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, TaskforgeError>;

impl TaskforgeError {
    /// Shorthand for the common wrong-status rejection.
    pub fn illegal(action: &'static str, current: TaskStatus) -> Self {
        TaskforgeError::IllegalState { action, current }
    }
}
