// src/exec/supervisor.rs

//! The supervisor owns the lifetime of a single execution: spawning the
//! child under `conda run`, draining its merged output, sampling memory,
//! enforcing the memory cap, pause/resume via signals over the process
//! tree, stop, and the completion commit.
//!
//! Locking discipline: repository and history mutexes are never held across
//! a syscall. Every operation copies the fields it needs out, releases the
//! lock, performs signalling / process IO, then reacquires to commit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use sysinfo::{Pid as SysPid, ProcessRefreshKind, System};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{Result, TaskforgeError};
use crate::exec::gate::{GateMap, GateWaiter};
use crate::exec::process_tree;
use crate::history::HistoryStore;
use crate::model::{ExecutionRecord, Task, TaskActionSummary};
use crate::repo::TaskRepository;
use crate::types::{ExecutionStatus, LogStream, TaskId, TaskStatus};

/// RSS sampling cadence.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// A currently supervised execution.
struct ActiveExecution {
    execution_id: Uuid,
    handle: tokio::task::JoinHandle<()>,
}

pub struct Supervisor {
    repo: Arc<TaskRepository>,
    history: Arc<HistoryStore>,
    conda_command: String,
    gates: GateMap,
    active: Mutex<HashMap<TaskId, ActiveExecution>>,
}

impl Supervisor {
    pub fn new(
        repo: Arc<TaskRepository>,
        history: Arc<HistoryStore>,
        conda_command: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            history,
            conda_command: conda_command.into(),
            gates: GateMap::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    fn active_lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, ActiveExecution>> {
        self.active.lock().expect("active execution map poisoned")
    }

    /// Whether this supervisor currently owns a live execution for the task.
    pub fn is_supervised(&self, task_id: TaskId) -> bool {
        self.active_lock()
            .get(&task_id)
            .map(|active| !active.handle.is_finished())
            .unwrap_or(false)
    }

    /// Execution id of the task's supervised execution, if one is live.
    pub fn active_execution_id(&self, task_id: TaskId) -> Option<Uuid> {
        self.active_lock().get(&task_id).map(|a| a.execution_id)
    }

    /// Whether the task's pause gate is currently closed.
    pub fn is_paused(&self, task_id: TaskId) -> bool {
        self.gates.is_paused(task_id)
    }

    fn launch_command(&self, task: &Task) -> String {
        match &task.command {
            Some(custom) => format!(
                "{} run -n {} {}",
                self.conda_command, task.conda_env, custom
            ),
            None => format!(
                "{} run -n {} python {}",
                self.conda_command,
                task.conda_env,
                task.script_path.display()
            ),
        }
    }

    fn working_dir(task: &Task) -> PathBuf {
        task.script_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Begin an execution for the task: create the record, mark the task
    /// running, and spawn the monitoring future. Returns the execution id.
    pub fn start_execution(self: &Arc<Self>, task_id: TaskId) -> Result<Uuid> {
        let task = self
            .repo
            .get_task(task_id)
            .ok_or(TaskforgeError::TaskNotFound(task_id))?;

        if self.is_supervised(task_id) {
            return Err(TaskforgeError::illegal("start", task.status));
        }

        let execution_id = Uuid::new_v4();
        let start_time = Utc::now();

        self.history
            .add_execution_record(task_id, ExecutionRecord::started(execution_id, start_time));

        let task = self.repo.update_task(task_id, |t| {
            t.status = TaskStatus::Running;
            t.last_execution_id = Some(execution_id);
            t.last_run_time = Some(start_time);
            t.executions.push(execution_id);
        })?;

        info!(task_id, %execution_id, task = %task.task_name, "execution starting");

        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            supervisor.run_execution(task, execution_id).await;
        });

        self.active_lock().insert(
            task_id,
            ActiveExecution {
                execution_id,
                handle,
            },
        );

        Ok(execution_id)
    }

    async fn run_execution(self: Arc<Self>, task: Task, execution_id: Uuid) {
        let task_id = task.task_id;
        let log_waiter = self.gates.register(task_id);

        let command_string = self.launch_command(&task);
        let working_dir = Self::working_dir(&task);

        // Emitted before spawn so the header always precedes child output.
        let header = format!(
            "Executing command: {command_string}\nWorking directory: {}\n\n",
            working_dir.display()
        );
        let _ = self
            .history
            .append_to_execution_log(task_id, execution_id, &header, LogStream::Logs);

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&command_string)
            .current_dir(&working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(task_id, %execution_id, error = %err, "failed to spawn task process");
                let _ = self.history.append_to_execution_log(
                    task_id,
                    execution_id,
                    &format!("\nError: {err}\n"),
                    LogStream::Logs,
                );
                self.finalize(task_id, execution_id, ExecutionStatus::Failed, None, Utc::now());
                self.cleanup(task_id);
                return;
            }
        };

        let pid = child.id().unwrap_or_default();
        if let Err(err) = self.repo.update_task(task_id, |t| {
            t.runtime.process_pid = Some(pid);
        }) {
            warn!(task_id, error = %err, "failed to record process pid");
        }

        // Memory sampler, gated the same way as the log readers.
        let sampler_waiter = self.gates.waiter(task_id).unwrap_or_else(|| log_waiter.clone());
        let sampler = tokio::spawn(Arc::clone(&self).sample_memory(
            task_id,
            execution_id,
            pid,
            task.memory_limit,
            sampler_waiter,
        ));

        // Drain stdout and stderr into the merged log, in write order per
        // stream. Each iteration checks the pause gate.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_drain = tokio::spawn(Arc::clone(&self).drain_pipe(
            task_id,
            execution_id,
            stdout,
            log_waiter.clone(),
        ));
        let stderr_drain = tokio::spawn(Arc::clone(&self).drain_pipe(
            task_id,
            execution_id,
            stderr,
            log_waiter,
        ));

        let exit = child.wait().await;

        // Let the readers consume whatever is still buffered before the
        // record is finalised.
        let _ = stdout_drain.await;
        let _ = stderr_drain.await;
        sampler.abort();

        let end_time = Utc::now();
        match exit {
            Ok(status) => {
                let exit_code = status.code().unwrap_or(-1);
                let outcome = if status.success() {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };
                info!(
                    task_id,
                    %execution_id,
                    exit_code,
                    success = status.success(),
                    "task process exited"
                );
                self.finalize(task_id, execution_id, outcome, Some(exit_code), end_time);
            }
            Err(err) => {
                error!(task_id, %execution_id, error = %err, "waiting on task process failed");
                let _ = self.history.append_to_execution_log(
                    task_id,
                    execution_id,
                    &format!("\nError: {err}\n"),
                    LogStream::Logs,
                );
                self.finalize(task_id, execution_id, ExecutionStatus::Failed, None, end_time);
            }
        }

        self.cleanup(task_id);
        debug!(task_id, %execution_id, "execution future finished");
    }

    async fn drain_pipe<R>(
        self: Arc<Self>,
        task_id: TaskId,
        execution_id: Uuid,
        pipe: Option<R>,
        mut waiter: GateWaiter,
    ) where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let Some(pipe) = pipe else { return };
        let mut lines = BufReader::new(pipe).lines();

        loop {
            waiter.wait_open().await;
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let chunk = format!("{line}\n");
                    if let Err(err) = self.history.append_to_execution_log(
                        task_id,
                        execution_id,
                        &chunk,
                        LogStream::Logs,
                    ) {
                        debug!(task_id, error = %err, "dropping log line for vanished record");
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    debug!(task_id, error = %err, "log pipe read failed");
                    return;
                }
            }
        }
    }

    async fn sample_memory(
        self: Arc<Self>,
        task_id: TaskId,
        execution_id: Uuid,
        pid: u32,
        memory_limit: Option<u64>,
        mut waiter: GateWaiter,
    ) {
        let mut sys = System::new();
        let sys_pid = SysPid::from_u32(pid);
        let refresh = ProcessRefreshKind::new().with_memory();

        loop {
            waiter.wait_open().await;

            if !sys.refresh_process_specifics(sys_pid, refresh) {
                break;
            }
            let Some(process) = sys.process(sys_pid) else {
                break;
            };

            let sample_mb = process.memory() as f64 / (1024.0 * 1024.0);
            self.history
                .append_memory_sample(task_id, execution_id, sample_mb);

            if let Some(limit) = memory_limit {
                if sample_mb > limit as f64 {
                    warn!(
                        task_id,
                        %execution_id,
                        limit_mb = limit,
                        sample_mb,
                        "memory limit exceeded; terminating process group"
                    );
                    self.enforce_memory_cap(task_id, execution_id, pid, limit, sample_mb)
                        .await;
                    break;
                }
            }

            tokio::time::sleep(SAMPLE_INTERVAL).await;
        }
    }

    /// Kill the process group and finalise the record as failed.
    async fn enforce_memory_cap(
        &self,
        task_id: TaskId,
        execution_id: Uuid,
        pid: u32,
        limit_mb: u64,
        reached_mb: f64,
    ) {
        let note = format!(
            "\nTask terminated: Memory usage exceeded limit of {limit_mb}MB (reached {reached_mb:.2}MB)"
        );
        let _ = self
            .history
            .append_to_execution_log(task_id, execution_id, &note, LogStream::Logs);

        self.finalize(task_id, execution_id, ExecutionStatus::Failed, None, Utc::now());

        // The child was spawned as its own process group leader, so this
        // takes the whole tree down.
        process_tree::terminate_process_group(pid).await;
    }

    /// Commit the end of an execution, unless another path (stop, memory
    /// cap) already finalised the record.
    fn finalize(
        &self,
        task_id: TaskId,
        execution_id: Uuid,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        end_time: DateTime<Utc>,
    ) {
        let mut already_terminal = false;
        let updated = self.history.update_execution_record(task_id, execution_id, |record| {
            if record.status.is_terminal() {
                already_terminal = true;
                return;
            }
            record.status = status;
            record.end_time = Some(end_time);
            record.exit_code = exit_code;
            record.duration =
                Some((end_time - record.start_time).num_milliseconds() as f64 / 1000.0);
            if let Some((peak, avg)) = record.memory_summary() {
                record.peak_memory = Some(peak);
                record.avg_memory = Some(avg);
            }
        });

        let record = match updated {
            Ok(record) => record,
            Err(err) => {
                warn!(task_id, %execution_id, error = %err, "missing record at finalisation");
                return;
            }
        };
        if already_terminal {
            debug!(task_id, %execution_id, "record already finalised; skipping commit");
            return;
        }

        let task_status = match status {
            ExecutionStatus::Completed => TaskStatus::Completed,
            ExecutionStatus::Stopped => TaskStatus::Stopped,
            _ => TaskStatus::Failed,
        };

        let commit = self.repo.update_task(task_id, |task| {
            task.runtime.process_pid = None;
            task.last_run_duration = record.duration;
            // A recurring task with a pending firing goes back into the
            // scheduled pool; the execution outcome lives on the record.
            if status != ExecutionStatus::Stopped
                && task.cron_expression.is_some()
                && task.next_run_time.is_some()
            {
                task.status = TaskStatus::Scheduled;
            } else {
                task.status = task_status;
                task.next_run_time = None;
            }
        });
        if let Err(err) = commit {
            warn!(task_id, error = %err, "failed to commit execution outcome");
        }
    }

    fn cleanup(&self, task_id: TaskId) {
        self.gates.remove(task_id);
        self.active_lock().remove(&task_id);
    }

    /// Suspend a running execution: close the gate, SIGSTOP the tree.
    pub fn pause(&self, task_id: TaskId) -> Result<TaskActionSummary> {
        let task = self
            .repo
            .get_task(task_id)
            .ok_or(TaskforgeError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Running {
            return Err(TaskforgeError::illegal("pause", task.status));
        }
        let Some(pid) = task.process_pid() else {
            return Err(TaskforgeError::illegal("pause", task.status));
        };

        let previous_status = task.status;
        let updated = self.repo.update_task(task_id, |t| {
            t.status = TaskStatus::Paused;
        })?;
        self.gates.close(task_id);

        // Signalling happens outside every lock.
        process_tree::signal_tree_leaves_first(pid, Signal::SIGSTOP);

        if let Some(execution_id) = task.last_execution_id {
            let _ = self.history.append_to_execution_log(
                task_id,
                execution_id,
                "\nTask was paused manually. Process execution suspended.",
                LogStream::Logs,
            );
        }

        info!(task_id, pid, "task paused");
        Ok(TaskActionSummary::new(&updated, previous_status))
    }

    /// Resume a paused execution: SIGCONT the tree, reopen the gate.
    pub fn resume(&self, task_id: TaskId) -> Result<TaskActionSummary> {
        let task = self
            .repo
            .get_task(task_id)
            .ok_or(TaskforgeError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Paused {
            return Err(TaskforgeError::illegal("resume", task.status));
        }
        let Some(pid) = task.process_pid() else {
            return Err(TaskforgeError::illegal("resume", task.status));
        };

        let previous_status = task.status;

        process_tree::signal_tree_root_first(pid, Signal::SIGCONT);

        let updated = self.repo.update_task(task_id, |t| {
            t.status = TaskStatus::Running;
        })?;
        self.gates.open(task_id);

        if let Some(execution_id) = task.last_execution_id {
            let _ = self.history.append_to_execution_log(
                task_id,
                execution_id,
                "\nTask was resumed manually. Process execution continued.",
                LogStream::Logs,
            );
        }

        info!(task_id, pid, "task resumed");
        Ok(TaskActionSummary::new(&updated, previous_status))
    }

    /// Stop a task in any stoppable state.
    ///
    /// - running/paused with a live child: terminate the tree (descendants
    ///   first), finalise the record as stopped;
    /// - scheduled (or finished): flip to stopped and clear `next_run_time`;
    /// - already stopped: refused.
    pub fn stop(&self, task_id: TaskId) -> Result<TaskActionSummary> {
        let task = self
            .repo
            .get_task(task_id)
            .ok_or(TaskforgeError::TaskNotFound(task_id))?;

        let previous_status = task.status;
        match task.status {
            TaskStatus::Stopped => Err(TaskforgeError::illegal("stop", task.status)),
            TaskStatus::Running | TaskStatus::Paused => {
                let pid = task.process_pid();
                let execution_id = task.last_execution_id;

                if let Some(execution_id) = execution_id {
                    let _ = self.history.append_to_execution_log(
                        task_id,
                        execution_id,
                        "\nTask was manually stopped",
                        LogStream::Logs,
                    );
                    self.finalize(
                        task_id,
                        execution_id,
                        ExecutionStatus::Stopped,
                        None,
                        Utc::now(),
                    );
                } else {
                    // No record to finalise; still honour the state change.
                    self.repo.update_task(task_id, |t| {
                        t.status = TaskStatus::Stopped;
                        t.next_run_time = None;
                        t.runtime.process_pid = None;
                    })?;
                }

                if let Some(pid) = pid {
                    if previous_status == TaskStatus::Paused {
                        // Wake the suspended tree so SIGTERM can be handled.
                        process_tree::signal_tree_root_first(pid, Signal::SIGCONT);
                    }
                    process_tree::signal_tree_leaves_first(pid, Signal::SIGTERM);
                }
                self.gates.open(task_id);

                let updated = self
                    .repo
                    .get_task(task_id)
                    .ok_or(TaskforgeError::TaskNotFound(task_id))?;
                info!(task_id, ?pid, "running task stopped");
                Ok(TaskActionSummary::new(&updated, previous_status))
            }
            TaskStatus::Scheduled | TaskStatus::Completed | TaskStatus::Failed => {
                let updated = self.repo.update_task(task_id, |t| {
                    t.status = TaskStatus::Stopped;
                    t.next_run_time = None;
                })?;
                info!(task_id, "task stopped");
                Ok(TaskActionSummary::new(&updated, previous_status))
            }
        }
    }
}
