// src/stats/mod.rs

//! Roll-up statistics over the task set and execution history.
//!
//! Everything here is computed on demand from snapshots; nothing is cached.
//! Memory samples carry no timestamps, so the 24-hour roll-up assumes the
//! samples of each execution are spread uniformly across its
//! `[start_time, end_time]` window when attributing them to wall-clock
//! hours.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;

use crate::model::{ExecutionRecord, Task};
use crate::types::{ExecutionStatus, TaskId, TaskStatus};

/// How many upcoming tasks and recent executions a report carries.
const UPCOMING_LIMIT: usize = 10;
const RECENT_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub counts: StatusCounts,
    pub durations: DurationSummary,
    /// completed / (completed + failed) over all executions, as a percentage.
    pub success_rate: f64,
    pub last_7_days: SevenDaySummary,
    pub memory_24h: MemoryDaySummary,
    pub upcoming_tasks: Vec<UpcomingTask>,
    pub recent_executions: Vec<RecentExecution>,
}

/// Cardinality of the task set by status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub scheduled: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
    pub stopped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DurationSummary {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

/// Per-day completed/failed counts for the trailing week, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct SevenDaySummary {
    pub dates: Vec<String>,
    pub success_counts: Vec<usize>,
    pub failed_counts: Vec<usize>,
}

/// Per-hour mean task memory for the trailing 24 hours, oldest first.
///
/// `memory_usage[i]` is `None` for hours with no overlapping samples.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryDaySummary {
    pub timestamps: Vec<String>,
    pub memory_usage: Vec<Option<f64>>,
    pub task_counts: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpcomingTask {
    pub task_id: TaskId,
    pub task_name: String,
    pub conda_env: String,
    pub command: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentExecution {
    pub task_id: TaskId,
    pub task_name: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
}

/// Build the full report from repository and history snapshots.
pub fn compute(
    tasks: &[Task],
    histories: &HashMap<TaskId, Vec<ExecutionRecord>>,
    now: DateTime<Utc>,
) -> StatsReport {
    StatsReport {
        counts: status_counts(tasks),
        durations: duration_summary(histories),
        success_rate: success_rate(histories),
        last_7_days: seven_day_summary(histories, now),
        memory_24h: memory_day_summary(histories, now),
        upcoming_tasks: upcoming_tasks(tasks, UPCOMING_LIMIT),
        recent_executions: recent_executions(tasks, histories, RECENT_LIMIT),
    }
}

fn status_counts(tasks: &[Task]) -> StatusCounts {
    let mut counts = StatusCounts {
        total: tasks.len(),
        ..StatusCounts::default()
    };
    for task in tasks {
        match task.status {
            TaskStatus::Scheduled => counts.scheduled += 1,
            TaskStatus::Running => counts.running += 1,
            TaskStatus::Completed => counts.completed += 1,
            TaskStatus::Failed => counts.failed += 1,
            TaskStatus::Paused => counts.paused += 1,
            TaskStatus::Stopped => counts.stopped += 1,
        }
    }
    counts
}

fn duration_summary(histories: &HashMap<TaskId, Vec<ExecutionRecord>>) -> DurationSummary {
    let durations: Vec<f64> = histories
        .values()
        .flatten()
        .filter_map(|r| r.duration)
        .collect();

    if durations.is_empty() {
        return DurationSummary::default();
    }

    DurationSummary {
        min: durations.iter().cloned().fold(f64::MAX, f64::min),
        avg: durations.iter().sum::<f64>() / durations.len() as f64,
        max: durations.iter().cloned().fold(f64::MIN, f64::max),
    }
}

fn success_rate(histories: &HashMap<TaskId, Vec<ExecutionRecord>>) -> f64 {
    let mut completed = 0usize;
    let mut failed = 0usize;
    for record in histories.values().flatten() {
        match record.status {
            ExecutionStatus::Completed => completed += 1,
            ExecutionStatus::Failed => failed += 1,
            _ => {}
        }
    }
    if completed + failed == 0 {
        return 0.0;
    }
    completed as f64 / (completed + failed) as f64 * 100.0
}

fn seven_day_summary(
    histories: &HashMap<TaskId, Vec<ExecutionRecord>>,
    now: DateTime<Utc>,
) -> SevenDaySummary {
    let dates: Vec<String> = (0..7)
        .rev()
        .map(|i| (now - Duration::days(i)).format("%Y-%m-%d").to_string())
        .collect();

    let mut success_counts = vec![0usize; 7];
    let mut failed_counts = vec![0usize; 7];

    for record in histories.values().flatten() {
        let day = record.start_time.format("%Y-%m-%d").to_string();
        if let Some(index) = dates.iter().position(|d| *d == day) {
            match record.status {
                ExecutionStatus::Completed => success_counts[index] += 1,
                ExecutionStatus::Failed => failed_counts[index] += 1,
                _ => {}
            }
        }
    }

    SevenDaySummary {
        dates,
        success_counts,
        failed_counts,
    }
}

fn truncate_to_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

fn memory_day_summary(
    histories: &HashMap<TaskId, Vec<ExecutionRecord>>,
    now: DateTime<Utc>,
) -> MemoryDaySummary {
    let current_hour = truncate_to_hour(now);
    let hours: Vec<DateTime<Utc>> = (0..24)
        .rev()
        .map(|i| current_hour - Duration::hours(i))
        .collect();

    let mut memory_usage = Vec::with_capacity(24);
    let mut task_counts = Vec::with_capacity(24);

    for hour_start in &hours {
        let hour_end = *hour_start + Duration::hours(1);

        let started_in_hour = histories
            .values()
            .flatten()
            .filter(|r| r.start_time >= *hour_start && r.start_time < hour_end)
            .count();
        task_counts.push(started_in_hour);

        let mut samples: Vec<f64> = Vec::new();
        for record in histories.values().flatten() {
            let end = record.end_time.unwrap_or(now);
            if record.start_time >= hour_end || end <= *hour_start {
                continue;
            }
            if record.memory_usage.is_empty() {
                continue;
            }

            // Samples carry no timestamps; assume they are uniformly spaced
            // over the execution window.
            let window_seconds = (end - record.start_time).num_milliseconds() as f64 / 1000.0;
            if window_seconds <= 0.0 {
                continue;
            }
            let seconds_per_sample = window_seconds / record.memory_usage.len() as f64;

            for (i, sample) in record.memory_usage.iter().enumerate() {
                let sample_time = record.start_time
                    + Duration::milliseconds((i as f64 * seconds_per_sample * 1000.0) as i64);
                if sample_time >= *hour_start && sample_time < hour_end {
                    samples.push(*sample);
                }
            }
        }

        if samples.is_empty() {
            memory_usage.push(None);
        } else {
            memory_usage.push(Some(samples.iter().sum::<f64>() / samples.len() as f64));
        }
    }

    MemoryDaySummary {
        timestamps: hours
            .iter()
            .map(|h| h.format("%Y-%m-%d %H:00:00").to_string())
            .collect(),
        memory_usage,
        task_counts,
    }
}

fn upcoming_tasks(tasks: &[Task], limit: usize) -> Vec<UpcomingTask> {
    let mut scheduled: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Scheduled)
        .collect();
    scheduled.sort_by_key(|t| t.next_run_time);

    scheduled
        .into_iter()
        .take(limit)
        .map(|task| {
            let command = match &task.command {
                Some(custom) => custom.clone(),
                None => format!("python {}", task.script_path.display()),
            };
            UpcomingTask {
                task_id: task.task_id,
                task_name: task.task_name.clone(),
                conda_env: task.conda_env.clone(),
                command,
                scheduled_time: task.next_run_time,
                cron_expression: task.cron_expression.clone(),
            }
        })
        .collect()
}

fn recent_executions(
    tasks: &[Task],
    histories: &HashMap<TaskId, Vec<ExecutionRecord>>,
    limit: usize,
) -> Vec<RecentExecution> {
    let mut all: Vec<RecentExecution> = histories
        .iter()
        .flat_map(|(task_id, records)| {
            let task_name = tasks
                .iter()
                .find(|t| t.task_id == *task_id)
                .map(|t| t.task_name.clone())
                .unwrap_or_else(|| format!("Task-{task_id}"));
            records.iter().map(move |record| RecentExecution {
                task_id: *task_id,
                task_name: task_name.clone(),
                status: record.status,
                start_time: record.start_time,
                end_time: record.end_time,
                duration: record.duration,
            })
        })
        .collect();

    all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    all.truncate(limit);
    all
}
