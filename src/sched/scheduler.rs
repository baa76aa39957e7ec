// src/sched/scheduler.rs

//! Task admission, lifecycle operations and the dispatch loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::conda::EnvironmentManager;
use crate::errors::{Result, TaskforgeError};
use crate::exec::Supervisor;
use crate::history::HistoryStore;
use crate::model::{
    ExecutionRecord, GitOrigin, Task, TaskActionSummary, TaskPatch, TaskRuntime,
};
use crate::persist::Persistence;
use crate::repo::TaskRepository;
use crate::sched::{cron, envprep, validate};
use crate::stats::{self, StatsReport};
use crate::types::{LogStream, Priority, TaskId, TaskStatus};

/// Everything a caller supplies when scheduling a task.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub script_path: PathBuf,
    pub conda_env: String,
    pub task_name: Option<String>,
    pub requirements: Option<String>,
    pub reuse_env: bool,
    pub cron_expression: Option<String>,
    pub delay_seconds: Option<i64>,
    pub priority: Priority,
    pub memory_limit: Option<u64>,
    pub command: Option<String>,
    pub git: Option<GitOrigin>,
}

impl ScheduleRequest {
    pub fn new(script_path: impl Into<PathBuf>, conda_env: impl Into<String>) -> Self {
        Self {
            script_path: script_path.into(),
            conda_env: conda_env.into(),
            task_name: None,
            requirements: None,
            reuse_env: false,
            cron_expression: None,
            delay_seconds: None,
            priority: Priority::Normal,
            memory_limit: None,
            command: None,
            git: None,
        }
    }
}

/// A task together with its execution history, for detail views.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskDetail {
    pub task: Task,
    pub execution_history: Vec<ExecutionRecord>,
    pub latest_execution: Option<ExecutionRecord>,
    pub performance: PerformanceMetrics,
}

/// Duration / memory series extracted from a task's history, oldest first.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PerformanceMetrics {
    pub timestamps: Vec<DateTime<Utc>>,
    pub durations: Vec<f64>,
    pub peak_memories: Vec<f64>,
    pub avg_memories: Vec<f64>,
}

/// Live log view for polling callers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogTail {
    pub logs: String,
    pub is_complete: bool,
    pub last_update: DateTime<Utc>,
}

/// Order due tasks for dispatch: priority descending, then earlier
/// `next_run_time` first as the tie-breaker.
pub fn order_due_tasks(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.next_run_time.cmp(&b.next_run_time))
    });
}

pub struct Scheduler {
    repo: Arc<TaskRepository>,
    history: Arc<HistoryStore>,
    supervisor: Arc<Supervisor>,
    envs: Arc<EnvironmentManager>,
    persistence: Arc<Persistence>,
    tick_interval: Duration,
    history_retention_days: i64,
}

impl Scheduler {
    pub fn new(
        repo: Arc<TaskRepository>,
        history: Arc<HistoryStore>,
        supervisor: Arc<Supervisor>,
        envs: Arc<EnvironmentManager>,
        persistence: Arc<Persistence>,
        tick_interval: Duration,
        history_retention_days: i64,
    ) -> Self {
        Self {
            repo,
            history,
            supervisor,
            envs,
            persistence,
            tick_interval,
            history_retention_days,
        }
    }

    // ---- admission ----------------------------------------------------------

    /// Validate, provision the environment if requirements were supplied,
    /// and admit the task as `scheduled`.
    pub async fn schedule_task(&self, request: ScheduleRequest) -> Result<Task> {
        validate::validate_request(&self.repo, &request)?;

        let now = Utc::now();
        let next_run_time = cron::compute_next_run_time(
            request.cron_expression.as_deref(),
            request.delay_seconds,
            now,
        )?;

        // Environment work happens before admission so a provisioning
        // failure never leaves a half-created task behind.
        let mut conda_env = request.conda_env.clone();
        if let Some(outcome) = envprep::provision(
            &self.envs,
            &request.conda_env,
            request.requirements.as_deref(),
            request.reuse_env,
        )
        .await?
        {
            conda_env = outcome.env_name;
        }

        let task_name = request.task_name.clone().unwrap_or_else(|| {
            request
                .script_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| request.script_path.display().to_string())
        });

        let task = Task {
            task_id: 0, // assigned by the repository
            task_name,
            script_path: request.script_path,
            command: request.command,
            conda_env,
            requirements: request.requirements,
            cron_expression: request.cron_expression,
            next_run_time: Some(next_run_time),
            priority: request.priority,
            memory_limit: request.memory_limit,
            status: TaskStatus::Scheduled,
            created_at: now,
            last_run_time: None,
            last_run_duration: None,
            last_execution_id: None,
            executions: Vec::new(),
            git: request.git,
            runtime: TaskRuntime::default(),
        };

        let task_id = self.repo.add_task(task)?;
        let task = self
            .repo
            .get_task(task_id)
            .ok_or(TaskforgeError::TaskNotFound(task_id))?;

        info!(
            task_id,
            task = %task.task_name,
            env = %task.conda_env,
            next_run = ?task.next_run_time,
            "task scheduled"
        );
        Ok(task)
    }

    // ---- queries ------------------------------------------------------------

    pub fn get_tasks(&self) -> Vec<Task> {
        self.repo.get_all_tasks()
    }

    pub fn get_task_detail(&self, task_id: TaskId) -> Result<TaskDetail> {
        let task = self
            .repo
            .get_task(task_id)
            .ok_or(TaskforgeError::TaskNotFound(task_id))?;

        let execution_history = self.history.task_history(task_id);
        let latest_execution = task.last_execution_id.and_then(|id| {
            execution_history
                .iter()
                .find(|r| r.execution_id == id)
                .cloned()
        });

        let mut performance = PerformanceMetrics::default();
        for record in &execution_history {
            if let Some(duration) = record.duration {
                performance.timestamps.push(record.start_time);
                performance.durations.push(duration);
            }
            if let Some(peak) = record.peak_memory {
                performance.peak_memories.push(peak);
            }
            if let Some(avg) = record.avg_memory {
                performance.avg_memories.push(avg);
            }
        }

        Ok(TaskDetail {
            task,
            execution_history,
            latest_execution,
            performance,
        })
    }

    /// Current log text of one execution, read from memory so a running
    /// task shows freshly buffered output.
    pub fn tail_logs(
        &self,
        task_id: TaskId,
        execution_id: Uuid,
        stream: LogStream,
    ) -> Result<LogTail> {
        let task = self
            .repo
            .get_task(task_id)
            .ok_or(TaskforgeError::TaskNotFound(task_id))?;

        let record = self
            .history
            .get_execution_record(task_id, execution_id)
            .ok_or(TaskforgeError::ExecutionNotFound {
                task_id,
                execution_id,
            })?;

        let logs = self
            .history
            .get_execution_logs(task_id, execution_id, stream)
            .unwrap_or_default();

        let mut is_complete = record.status.is_terminal();
        if task.status == TaskStatus::Running && task.last_execution_id == Some(execution_id) {
            is_complete = false;
        }

        Ok(LogTail {
            logs,
            is_complete,
            last_update: Utc::now(),
        })
    }

    /// Roll-up statistics; the report is also snapshotted to the stats file
    /// on a best-effort basis.
    pub fn stats(&self) -> StatsReport {
        let report = stats::compute(
            &self.repo.get_all_tasks(),
            &self.history.all_histories(),
            Utc::now(),
        );
        if let Err(err) = self.persistence.save_tasks_stats(&report) {
            debug!(error = %err, "failed to snapshot stats");
        }
        report
    }

    // ---- lifecycle operations ----------------------------------------------

    pub fn pause_task(&self, task_id: TaskId) -> Result<TaskActionSummary> {
        self.supervisor.pause(task_id)
    }

    /// Resume a paused task.
    ///
    /// A paused execution is resumed in place. A task that is `paused` but
    /// has no supervised execution (daemon restarted underneath it) is
    /// re-admitted to the scheduled pool instead.
    pub fn resume_task(&self, task_id: TaskId) -> Result<TaskActionSummary> {
        if self.supervisor.is_supervised(task_id) {
            return self.supervisor.resume(task_id);
        }

        let task = self
            .repo
            .get_task(task_id)
            .ok_or(TaskforgeError::TaskNotFound(task_id))?;
        if task.status != TaskStatus::Paused {
            return Err(TaskforgeError::illegal("resume", task.status));
        }

        let previous_status = task.status;
        let now = Utc::now();
        let next_run_time = match task.cron_expression.as_deref() {
            Some(expression) => cron::next_cron_firing(expression, now)?,
            None => now,
        };

        let updated = self.repo.update_task(task_id, |t| {
            t.status = TaskStatus::Scheduled;
            t.next_run_time = Some(next_run_time);
            t.runtime = TaskRuntime::default();
        })?;

        info!(task_id, "unsupervised paused task re-admitted");
        Ok(TaskActionSummary::new(&updated, previous_status))
    }

    pub fn stop_task(&self, task_id: TaskId) -> Result<TaskActionSummary> {
        self.supervisor.stop(task_id)
    }

    /// Run a task immediately, regardless of its schedule.
    ///
    /// Allowed from `scheduled`, `stopped`, `paused` (when no suspended
    /// execution is live) and the terminal states; forbidden while
    /// `running`. A recurring task's `next_run_time` is left untouched so
    /// the cron sequence is not perturbed.
    pub fn trigger_task(&self, task_id: TaskId) -> Result<TaskActionSummary> {
        let task = self
            .repo
            .get_task(task_id)
            .ok_or(TaskforgeError::TaskNotFound(task_id))?;

        match task.status {
            TaskStatus::Running => {
                return Err(TaskforgeError::illegal("trigger", task.status));
            }
            TaskStatus::Paused if self.supervisor.is_supervised(task_id) => {
                // A suspended child is still alive; spawning a second one
                // would orphan it. Resume or stop first.
                return Err(TaskforgeError::illegal("trigger", task.status));
            }
            _ => {}
        }

        let previous_status = task.status;
        if matches!(task.status, TaskStatus::Stopped | TaskStatus::Paused) {
            self.repo.update_task(task_id, |t| {
                t.status = TaskStatus::Scheduled;
            })?;
        }

        let execution_id = self.supervisor.start_execution(task_id)?;

        let updated = self
            .repo
            .get_task(task_id)
            .ok_or(TaskforgeError::TaskNotFound(task_id))?;

        info!(task_id, %execution_id, "task triggered");
        Ok(TaskActionSummary::new(&updated, previous_status).with_execution(execution_id))
    }

    /// Apply a patch to a task's definition.
    pub fn update_task(&self, task_id: TaskId, patch: TaskPatch) -> Result<Task> {
        let task = self
            .repo
            .get_task(task_id)
            .ok_or(TaskforgeError::TaskNotFound(task_id))?;

        if patch.cron_expression.as_ref().is_some_and(|c| c.is_some())
            && patch.delay_seconds.is_some()
        {
            return Err(TaskforgeError::InvalidArgs(
                "cannot specify both cron_expression and delay_seconds".to_string(),
            ));
        }

        if let Some(name) = &patch.task_name {
            if let Some(existing) = self.repo.get_task_by_name(name) {
                if existing.task_id != task_id {
                    return Err(TaskforgeError::AlreadyExists(format!("task '{name}'")));
                }
            }
        }

        if let Some(Some(limit)) = patch.memory_limit {
            if limit == 0 {
                return Err(TaskforgeError::InvalidArgs(
                    "memory_limit must be a positive integer".to_string(),
                ));
            }
        }

        // Recompute the schedule before taking the lock, so parse errors
        // reject the patch without touching the task.
        let now = Utc::now();
        let new_schedule = if patch.reschedules() {
            let cron_expression = match &patch.cron_expression {
                Some(value) => value.clone(),
                None => None, // delay patch clears any recurring schedule
            };
            let next_run_time =
                cron::compute_next_run_time(cron_expression.as_deref(), patch.delay_seconds, now)?;
            Some((cron_expression, next_run_time))
        } else {
            None
        };

        let updated = self.repo.update_task(task_id, |t| {
            if let Some(name) = patch.task_name {
                t.task_name = name;
            }
            if let Some(env) = patch.conda_env {
                t.conda_env = env;
            }
            if let Some(command) = patch.command {
                t.command = command;
            }
            if let Some(priority) = patch.priority {
                t.priority = priority;
            }
            if let Some(limit) = patch.memory_limit {
                t.memory_limit = limit;
            }
            if let Some((cron_expression, next_run_time)) = new_schedule {
                t.cron_expression = cron_expression;
                // Only a task waiting in the scheduled pool gets the new
                // firing immediately; other states pick it up on trigger.
                if t.status == TaskStatus::Scheduled {
                    t.next_run_time = Some(next_run_time);
                }
            }
        })?;

        debug!(task_id, task = %task.task_name, "task updated");
        Ok(updated)
    }

    /// Delete a task; refused while it is running.
    pub fn delete_task(&self, task_id: TaskId) -> Result<()> {
        let task = self
            .repo
            .get_task(task_id)
            .ok_or(TaskforgeError::TaskNotFound(task_id))?;

        if task.status == TaskStatus::Running {
            return Err(TaskforgeError::illegal("delete", task.status));
        }

        self.repo.delete_task(task_id)?;
        info!(task_id, task = %task.task_name, "task deleted");
        Ok(())
    }

    // ---- dispatch loop ------------------------------------------------------

    /// One dispatch tick: start everything that is due (priority order),
    /// re-arm recurring tasks, then prune old history.
    pub async fn run_dispatch_tick(&self) {
        let now = Utc::now();

        let mut due: Vec<Task> = self
            .repo
            .get_tasks_by_status(TaskStatus::Scheduled)
            .into_iter()
            .filter(|t| t.next_run_time.is_some_and(|at| at <= now))
            .collect();

        if !due.is_empty() {
            order_due_tasks(&mut due);
            debug!(count = due.len(), "dispatching due tasks");
        }

        for task in due {
            // Re-arm before the spawn so a fast-finishing recurring child
            // always observes its subsequent firing, and so a failed
            // dispatch leaves the task scheduled with the computed future
            // `next_run_time`.
            let next_run_time = task
                .cron_expression
                .as_deref()
                .and_then(|expression| match cron::next_cron_firing(expression, now) {
                    Ok(at) => Some(at),
                    Err(err) => {
                        error!(task_id = task.task_id, error = %err, "cron re-arm failed");
                        None
                    }
                });

            if let Err(err) = self.repo.update_task(task.task_id, |t| {
                t.next_run_time = next_run_time;
            }) {
                warn!(task_id = task.task_id, error = %err, "failed to re-arm task");
            }

            if let Err(err) = self.supervisor.start_execution(task.task_id) {
                warn!(task_id = task.task_id, error = %err, "dispatch failed");
            }
        }

        self.history.clean_old_records(self.history_retention_days);
    }

    /// Spawn the background dispatch loop. It wakes every tick interval
    /// until the shutdown channel flips to `true` or is dropped.
    pub fn spawn_dispatch_loop(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!("dispatch loop started");
            let mut ticker = tokio::time::interval(scheduler.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.run_dispatch_tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("dispatch loop exiting");
        })
    }
}
