// tests/supervisor_exec.rs

//! End-to-end supervision of real child processes.
//!
//! A stub `conda` executable (which just drops `run -n <env>` and execs the
//! rest of the command line) stands in for the real thing, so tasks spawn
//! ordinary shell commands.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use taskforge::config::Settings;
use taskforge::sched::ScheduleRequest;
use taskforge::types::{ExecutionStatus, LogStream, TaskStatus};
use taskforge::App;
use taskforge_test_utils::fake_conda::FakeCondaBackend;
use taskforge_test_utils::init_tracing;

/// Install the stub conda script into the state dir and return its path.
fn write_conda_stub(dir: &Path) -> String {
    let path = dir.join("conda-stub");
    std::fs::write(&path, "#!/bin/sh\n# drop: run -n <env>\nshift 3\nexec \"$@\"\n").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.display().to_string()
}

fn app() -> (tempfile::TempDir, App) {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.state_dir = dir.path().to_path_buf();
    settings.conda_command = write_conda_stub(dir.path());
    let app = App::bootstrap_with_backend(&settings, Box::new(FakeCondaBackend::new())).unwrap();
    (dir, app)
}

/// Poll until `predicate` holds or the timeout elapses.
async fn wait_until<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    predicate()
}

/// State field of `/proc/<pid>/stat`. The command name can itself contain
/// spaces or parens, so split after the *last* ')'.
fn proc_state(pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

#[tokio::test(flavor = "multi_thread")]
async fn one_shot_task_runs_to_completion() {
    init_tracing();
    let (_dir, app) = app();

    let mut request = ScheduleRequest::new("/tmp/hello.py", "e1");
    request.command = Some("echo hi".to_string());
    request.delay_seconds = Some(0);
    let task = app.scheduler.schedule_task(request).await.unwrap();

    app.scheduler.run_dispatch_tick().await;

    let done = wait_until(Duration::from_secs(5), || {
        app.repo.get_task(task.task_id).unwrap().status == TaskStatus::Completed
    })
    .await;
    assert!(done, "task did not complete in time");

    let finished = app.repo.get_task(task.task_id).unwrap();
    assert_eq!(finished.next_run_time, None);
    assert_eq!(finished.process_pid(), None);
    assert_eq!(finished.executions.len(), 1);

    let record = &app.history.task_history(task.task_id)[0];
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.exit_code, Some(0));
    assert!(record.end_time.unwrap() >= record.start_time);
    assert!(record.duration.unwrap() >= 0.0);
    assert!(record.logs.contains("Executing command:"));
    assert!(record.logs.contains("hi"));
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_child_marks_the_task_failed() {
    init_tracing();
    let (_dir, app) = app();

    let mut request = ScheduleRequest::new("/tmp/fail.py", "e1");
    request.command = Some("false".to_string());
    request.delay_seconds = Some(0);
    let task = app.scheduler.schedule_task(request).await.unwrap();

    app.scheduler.run_dispatch_tick().await;

    let done = wait_until(Duration::from_secs(5), || {
        app.repo.get_task(task.task_id).unwrap().status == TaskStatus::Failed
    })
    .await;
    assert!(done, "task did not fail in time");

    let record = &app.history.task_history(task.task_id)[0];
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.exit_code, Some(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_terminates_a_running_task() {
    init_tracing();
    let (_dir, app) = app();

    let mut request = ScheduleRequest::new("/tmp/long.py", "e1");
    request.command = Some("sleep 30".to_string());
    request.delay_seconds = Some(0);
    let task = app.scheduler.schedule_task(request).await.unwrap();

    let summary = app.scheduler.trigger_task(task.task_id).unwrap();
    assert!(summary.execution_id.is_some());

    let running = wait_until(Duration::from_secs(5), || {
        let t = app.repo.get_task(task.task_id).unwrap();
        t.status == TaskStatus::Running && t.process_pid().is_some()
    })
    .await;
    assert!(running, "task never reached running state");

    let stopped = app.scheduler.stop_task(task.task_id).unwrap();
    assert_eq!(stopped.status, TaskStatus::Stopped);
    assert_eq!(stopped.previous_status, TaskStatus::Running);

    let task_after = app.repo.get_task(task.task_id).unwrap();
    assert_eq!(task_after.status, TaskStatus::Stopped);
    assert_eq!(task_after.next_run_time, None);

    let execution_id = summary.execution_id.unwrap();
    let cleaned = wait_until(Duration::from_secs(5), || {
        !app.supervisor.is_supervised(task.task_id)
    })
    .await;
    assert!(cleaned, "supervisor did not release the execution");

    let record = app
        .history
        .get_execution_record(task.task_id, execution_id)
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Stopped);
    assert!(record.logs.contains("Task was manually stopped"));
    assert_eq!(task_after.process_pid(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_suspends_and_resume_continues_the_child() {
    init_tracing();
    let (_dir, app) = app();

    let mut request = ScheduleRequest::new("/tmp/pausable.py", "e1");
    request.command = Some("sleep 30".to_string());
    request.delay_seconds = Some(0);
    let task = app.scheduler.schedule_task(request).await.unwrap();

    app.scheduler.trigger_task(task.task_id).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let t = app.repo.get_task(task.task_id).unwrap();
            t.status == TaskStatus::Running && t.process_pid().is_some()
        })
        .await
    );

    let pid = app.repo.get_task(task.task_id).unwrap().process_pid().unwrap();

    let paused = app.scheduler.pause_task(task.task_id).unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert_eq!(paused.previous_status, TaskStatus::Running);
    assert!(app.supervisor.is_paused(task.task_id));

    // The suspended child shows state 'T' in the process table.
    if cfg!(target_os = "linux") {
        assert!(
            wait_until(Duration::from_secs(2), || proc_state(pid) == Some('T')).await,
            "child process was not suspended"
        );
    }

    // Pausing twice is an IllegalState.
    assert!(app.scheduler.pause_task(task.task_id).is_err());

    let resumed = app.scheduler.resume_task(task.task_id).unwrap();
    assert_eq!(resumed.status, TaskStatus::Running);
    assert_eq!(resumed.previous_status, TaskStatus::Paused);
    assert!(!app.supervisor.is_paused(task.task_id));

    if cfg!(target_os = "linux") {
        assert!(
            wait_until(Duration::from_secs(2), || {
                matches!(proc_state(pid), Some('S') | Some('R'))
            })
            .await,
            "child process did not resume"
        );
    }

    // Tidy up the long-running child.
    app.scheduler.stop_task(task.task_id).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn tail_logs_reads_the_live_record() {
    init_tracing();
    let (_dir, app) = app();

    let mut request = ScheduleRequest::new("/tmp/chatty.py", "e1");
    request.command = Some("echo line-one".to_string());
    request.delay_seconds = Some(0);
    let task = app.scheduler.schedule_task(request).await.unwrap();

    let summary = app.scheduler.trigger_task(task.task_id).unwrap();
    let execution_id = summary.execution_id.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            app.repo.get_task(task.task_id).unwrap().status == TaskStatus::Completed
        })
        .await
    );

    let tail = app
        .scheduler
        .tail_logs(task.task_id, execution_id, LogStream::Logs)
        .unwrap();
    assert!(tail.is_complete);
    assert!(tail.logs.contains("line-one"));
}

#[tokio::test(flavor = "multi_thread")]
async fn recurring_task_returns_to_the_scheduled_pool() {
    init_tracing();
    let (_dir, app) = app();

    let mut request = ScheduleRequest::new("/tmp/cronjob.py", "e1");
    request.command = Some("echo tick".to_string());
    request.cron_expression = Some("* * * * *".to_string());
    let task = app.scheduler.schedule_task(request).await.unwrap();

    // Force the task due now rather than waiting for the minute boundary.
    app.repo
        .update_task(task.task_id, |t| {
            t.next_run_time = Some(chrono::Utc::now());
        })
        .unwrap();

    app.scheduler.run_dispatch_tick().await;

    // After completion the task is scheduled again with a future firing.
    let rearmed = wait_until(Duration::from_secs(5), || {
        let t = app.repo.get_task(task.task_id).unwrap();
        t.status == TaskStatus::Scheduled && t.next_run_time.is_some()
    })
    .await;
    assert!(rearmed, "recurring task was not re-armed");

    let record = &app.history.task_history(task.task_id)[0];
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(app.repo.get_task(task.task_id).unwrap().next_run_time.is_some());
}
