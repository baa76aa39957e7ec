// src/sched/validate.rs

//! Admission validation for new tasks.

use crate::errors::{Result, TaskforgeError};
use crate::repo::TaskRepository;
use crate::sched::ScheduleRequest;

/// Reject schema-level problems before any environment work happens.
pub fn validate_request(repo: &TaskRepository, request: &ScheduleRequest) -> Result<()> {
    if request.script_path.as_os_str().is_empty() {
        return Err(TaskforgeError::InvalidArgs(
            "script_path is required".to_string(),
        ));
    }

    if request.conda_env.trim().is_empty() {
        return Err(TaskforgeError::InvalidArgs(
            "conda_env is required".to_string(),
        ));
    }

    if request.cron_expression.is_some() && request.delay_seconds.is_some() {
        return Err(TaskforgeError::InvalidArgs(
            "cannot specify both cron_expression and delay_seconds".to_string(),
        ));
    }

    if let Some(limit) = request.memory_limit {
        if limit == 0 {
            return Err(TaskforgeError::InvalidArgs(
                "memory_limit must be a positive integer".to_string(),
            ));
        }
    }

    if let Some(name) = &request.task_name {
        if repo.get_task_by_name(name).is_some() {
            return Err(TaskforgeError::AlreadyExists(format!("task '{name}'")));
        }
    }

    Ok(())
}
