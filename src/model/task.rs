// src/model/task.rs

//! The task record: the scheduled unit owned by the repository.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Priority, TaskId, TaskStatus};

/// A user-defined schedulable unit: script + environment + schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,

    /// Unique among live tasks; defaults to the script filename.
    pub task_name: String,

    /// Absolute path to the script file, or the unpacked directory for
    /// archive-sourced tasks.
    pub script_path: PathBuf,

    /// Custom launch command; `python <script_path>` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Name of the Conda environment the child runs under.
    pub conda_env: String,

    /// Raw requirements text the task was submitted with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,

    /// Standard 5-field cron expression for recurring tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,

    /// Non-null exactly while the task is `scheduled`.
    pub next_run_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub priority: Priority,

    /// RSS cap in MB enforced by the supervisor's sampler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,

    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub last_run_time: Option<DateTime<Utc>>,
    /// Seconds.
    pub last_run_duration: Option<f64>,
    pub last_execution_id: Option<Uuid>,

    /// Execution ids belonging to this task, in start order.
    #[serde(default)]
    pub executions: Vec<Uuid>,

    /// Present for tasks ingested from a Git repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitOrigin>,

    /// Transient per-process state; never persisted.
    #[serde(skip)]
    pub runtime: TaskRuntime,
}

impl Task {
    /// `process_pid` of the live child, if any.
    pub fn process_pid(&self) -> Option<u32> {
        self.runtime.process_pid
    }

    /// Whether an execution currently owns a child process.
    pub fn has_live_process(&self) -> bool {
        matches!(self.status, TaskStatus::Running | TaskStatus::Paused)
    }
}

/// Where a Git-ingested task came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitOrigin {
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Transient runtime state attached to a task while a child process exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskRuntime {
    pub process_pid: Option<u32>,
}

/// A field-wise patch applied by `update_task`.
///
/// Outer `None` leaves a field untouched; `Some(None)` on the double-option
/// fields clears the value.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub task_name: Option<String>,
    pub conda_env: Option<String>,
    pub command: Option<Option<String>>,
    pub cron_expression: Option<Option<String>>,
    pub delay_seconds: Option<i64>,
    pub priority: Option<Priority>,
    pub memory_limit: Option<Option<u64>>,
}

impl TaskPatch {
    /// True if the patch touches either schedule source, which forces a
    /// `next_run_time` recomputation.
    pub fn reschedules(&self) -> bool {
        self.cron_expression.is_some() || self.delay_seconds.is_some()
    }
}

/// Compact task view returned from lifecycle operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskActionSummary {
    pub task_id: TaskId,
    pub task_name: String,
    pub status: TaskStatus,
    pub previous_status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
}

impl TaskActionSummary {
    pub fn new(task: &Task, previous_status: TaskStatus) -> Self {
        Self {
            task_id: task.task_id,
            task_name: task.task_name.clone(),
            status: task.status,
            previous_status,
            next_run_time: task.next_run_time,
            execution_id: None,
        }
    }

    pub fn with_execution(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }
}
