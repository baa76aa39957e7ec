#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use taskforge::model::{ExecutionRecord, Task, TaskRuntime};
use taskforge::types::{ExecutionStatus, Priority, TaskId, TaskStatus};

/// Builder for `Task` to simplify test setup.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(task_id: TaskId, name: &str) -> Self {
        Self {
            task: Task {
                task_id,
                task_name: name.to_string(),
                script_path: format!("/opt/scripts/{name}.py").into(),
                command: None,
                conda_env: "base-env".to_string(),
                requirements: None,
                cron_expression: None,
                next_run_time: None,
                priority: Priority::Normal,
                memory_limit: None,
                status: TaskStatus::Scheduled,
                created_at: Utc::now(),
                last_run_time: None,
                last_run_duration: None,
                last_execution_id: None,
                executions: vec![],
                git: None,
                runtime: TaskRuntime::default(),
            },
        }
    }

    pub fn script(mut self, path: &str) -> Self {
        self.task.script_path = path.into();
        self
    }

    pub fn command(mut self, command: &str) -> Self {
        self.task.command = Some(command.to_string());
        self
    }

    pub fn conda_env(mut self, env: &str) -> Self {
        self.task.conda_env = env.to_string();
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn cron(mut self, expression: &str) -> Self {
        self.task.cron_expression = Some(expression.to_string());
        self
    }

    pub fn memory_limit(mut self, limit_mb: u64) -> Self {
        self.task.memory_limit = Some(limit_mb);
        self
    }

    pub fn next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.next_run_time = Some(at);
        self
    }

    pub fn next_run_in_seconds(mut self, seconds: i64) -> Self {
        self.task.next_run_time = Some(Utc::now() + Duration::seconds(seconds));
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Builder for `ExecutionRecord`.
pub struct ExecutionRecordBuilder {
    record: ExecutionRecord,
}

impl ExecutionRecordBuilder {
    pub fn started_at(start: DateTime<Utc>) -> Self {
        Self {
            record: ExecutionRecord::started(Uuid::new_v4(), start),
        }
    }

    pub fn execution_id(mut self, id: Uuid) -> Self {
        self.record.execution_id = id;
        self
    }

    pub fn finished(mut self, status: ExecutionStatus, end: DateTime<Utc>, exit_code: i32) -> Self {
        self.record.status = status;
        self.record.end_time = Some(end);
        self.record.exit_code = Some(exit_code);
        self.record.duration =
            Some((end - self.record.start_time).num_milliseconds() as f64 / 1000.0);
        self
    }

    pub fn memory_samples(mut self, samples: &[f64]) -> Self {
        self.record.memory_usage = samples.to_vec();
        if let Some((peak, avg)) = self.record.memory_summary() {
            if self.record.status.is_terminal() {
                self.record.peak_memory = Some(peak);
                self.record.avg_memory = Some(avg);
            }
        }
        self
    }

    pub fn logs(mut self, logs: &str) -> Self {
        self.record.logs = logs.to_string();
        self
    }

    pub fn build(self) -> ExecutionRecord {
        self.record
    }
}
