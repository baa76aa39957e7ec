// tests/scheduler_ops.rs

//! Scheduler admission, validation, provisioning and lifecycle operations,
//! exercised through the full application object with a fake conda backend.

use chrono::{Duration, Utc};

use taskforge::config::Settings;
use taskforge::errors::TaskforgeError;
use taskforge::model::TaskPatch;
use taskforge::sched::{order_due_tasks, ScheduleRequest};
use taskforge::types::{Priority, TaskStatus};
use taskforge::App;
use taskforge_test_utils::builders::TaskBuilder;
use taskforge_test_utils::fake_conda::FakeCondaBackend;
use taskforge_test_utils::init_tracing;

fn settings(dir: &tempfile::TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.state_dir = dir.path().to_path_buf();
    settings
}

fn app_with(backend: FakeCondaBackend) -> (tempfile::TempDir, App) {
    let dir = tempfile::tempdir().unwrap();
    let app = App::bootstrap_with_backend(&settings(&dir), Box::new(backend)).unwrap();
    (dir, app)
}

#[tokio::test]
async fn one_shot_delay_is_admitted_as_scheduled() {
    init_tracing();
    let (_dir, app) = app_with(FakeCondaBackend::new());

    let mut request = ScheduleRequest::new("/opt/jobs/hello.py", "e1");
    request.delay_seconds = Some(120);

    let before = Utc::now();
    let task = app.scheduler.schedule_task(request).await.unwrap();

    assert_eq!(task.status, TaskStatus::Scheduled);
    assert_eq!(task.task_name, "hello.py"); // defaults to the script filename
    let next_run = task.next_run_time.unwrap();
    assert!(next_run >= before + Duration::seconds(119));
    assert!(next_run <= Utc::now() + Duration::seconds(121));
}

#[tokio::test]
async fn cron_task_gets_the_next_firing() {
    init_tracing();
    let (_dir, app) = app_with(FakeCondaBackend::new());

    let mut request = ScheduleRequest::new("/opt/jobs/s.py", "e1");
    request.cron_expression = Some("* * * * *".to_string());

    let task = app.scheduler.schedule_task(request).await.unwrap();
    let next_run = task.next_run_time.unwrap();
    assert!(next_run > Utc::now());
    assert!(next_run <= Utc::now() + Duration::seconds(61));
}

#[tokio::test]
async fn admission_validation_rejects_bad_requests() {
    init_tracing();
    let (_dir, app) = app_with(FakeCondaBackend::new());

    // cron and delay are mutually exclusive
    let mut both = ScheduleRequest::new("/opt/jobs/a.py", "e1");
    both.cron_expression = Some("* * * * *".to_string());
    both.delay_seconds = Some(5);
    assert!(matches!(
        app.scheduler.schedule_task(both).await.unwrap_err(),
        TaskforgeError::InvalidArgs(_)
    ));

    // unparseable cron
    let mut bad_cron = ScheduleRequest::new("/opt/jobs/a.py", "e1");
    bad_cron.cron_expression = Some("not a cron".to_string());
    assert!(matches!(
        app.scheduler.schedule_task(bad_cron).await.unwrap_err(),
        TaskforgeError::InvalidCron { .. }
    ));

    // non-positive memory limit
    let mut bad_limit = ScheduleRequest::new("/opt/jobs/a.py", "e1");
    bad_limit.memory_limit = Some(0);
    assert!(matches!(
        app.scheduler.schedule_task(bad_limit).await.unwrap_err(),
        TaskforgeError::InvalidArgs(_)
    ));

    // empty conda env
    let empty_env = ScheduleRequest::new("/opt/jobs/a.py", "  ");
    assert!(matches!(
        app.scheduler.schedule_task(empty_env).await.unwrap_err(),
        TaskforgeError::InvalidArgs(_)
    ));

    // duplicate task name
    let mut first = ScheduleRequest::new("/opt/jobs/a.py", "e1");
    first.task_name = Some("uniq".to_string());
    app.scheduler.schedule_task(first).await.unwrap();

    let mut dup = ScheduleRequest::new("/opt/jobs/b.py", "e1");
    dup.task_name = Some("uniq".to_string());
    assert!(matches!(
        app.scheduler.schedule_task(dup).await.unwrap_err(),
        TaskforgeError::AlreadyExists(_)
    ));
}

#[tokio::test]
async fn reuse_env_installs_requirements_into_the_existing_env() {
    init_tracing();
    let backend = FakeCondaBackend::new().with_env("ml");
    let (_dir, app) = app_with(backend.clone());

    let mut request = ScheduleRequest::new("/opt/jobs/train.py", "ml");
    request.reuse_env = true;
    request.requirements = Some("# deps\nnumpy==1.26\npandas\n".to_string());

    let task = app.scheduler.schedule_task(request).await.unwrap();
    assert_eq!(task.conda_env, "ml");

    let ops = backend.operations();
    assert!(ops.iter().any(|op| op == "install ml numpy==1.26,pandas"));
}

#[tokio::test]
async fn reuse_env_requires_the_env_to_exist() {
    init_tracing();
    let (_dir, app) = app_with(FakeCondaBackend::new());

    let mut request = ScheduleRequest::new("/opt/jobs/train.py", "ghost");
    request.reuse_env = true;
    request.requirements = Some("numpy\n".to_string());

    assert!(matches!(
        app.scheduler.schedule_task(request).await.unwrap_err(),
        TaskforgeError::EnvMissing(_)
    ));
}

#[tokio::test]
async fn fresh_env_provisioning_picks_the_first_unused_suffix() {
    init_tracing();
    let backend = FakeCondaBackend::new().with_env("analytics").with_env("analytics_1");
    let (_dir, app) = app_with(backend.clone());

    let mut request = ScheduleRequest::new("/opt/jobs/report.py", "analytics");
    request.requirements = Some("requests\n".to_string());

    let task = app.scheduler.schedule_task(request).await.unwrap();

    // The finally-used name is substituted back into the task.
    assert_eq!(task.conda_env, "analytics_2");
    assert!(backend.env_names().contains(&"analytics_2".to_string()));
}

#[tokio::test]
async fn failed_install_rolls_back_the_fresh_env_and_rejects_the_task() {
    init_tracing();
    let backend = FakeCondaBackend::new().with_unresolvable("nosuchpkg");
    let (_dir, app) = app_with(backend.clone());

    let mut request = ScheduleRequest::new("/opt/jobs/x.py", "scratch");
    request.requirements = Some("nosuchpkg\n".to_string());

    let err = app.scheduler.schedule_task(request).await.unwrap_err();
    assert!(matches!(err, TaskforgeError::PackageNotFound { .. }));

    // The just-created env was deleted again and no task was admitted.
    assert!(!backend.env_names().contains(&"scratch".to_string()));
    assert!(app.scheduler.get_tasks().is_empty());
}

#[tokio::test]
async fn stopping_a_scheduled_recurring_task_clears_next_run_time() {
    init_tracing();
    let (_dir, app) = app_with(FakeCondaBackend::new());

    let mut request = ScheduleRequest::new("/opt/jobs/s.py", "e1");
    request.cron_expression = Some("* * * * *".to_string());
    let task = app.scheduler.schedule_task(request).await.unwrap();

    let summary = app.scheduler.stop_task(task.task_id).unwrap();
    assert_eq!(summary.status, TaskStatus::Stopped);
    assert_eq!(summary.previous_status, TaskStatus::Scheduled);
    assert_eq!(summary.next_run_time, None);

    // Idempotence: stopping again is an IllegalState, without side effects.
    assert!(matches!(
        app.scheduler.stop_task(task.task_id).unwrap_err(),
        TaskforgeError::IllegalState { .. }
    ));

    // The dispatch loop must not start it.
    app.scheduler.run_dispatch_tick().await;
    assert!(app.history.task_history(task.task_id).is_empty());
    assert_eq!(
        app.repo.get_task(task.task_id).unwrap().status,
        TaskStatus::Stopped
    );
}

#[tokio::test]
async fn lifecycle_guards_reject_wrong_states() {
    init_tracing();
    let (_dir, app) = app_with(FakeCondaBackend::new());

    let mut request = ScheduleRequest::new("/opt/jobs/a.py", "e1");
    request.delay_seconds = Some(3600);
    let task = app.scheduler.schedule_task(request).await.unwrap();

    // pause requires running
    assert!(matches!(
        app.scheduler.pause_task(task.task_id).unwrap_err(),
        TaskforgeError::IllegalState { .. }
    ));
    // resume requires paused
    assert!(matches!(
        app.scheduler.resume_task(task.task_id).unwrap_err(),
        TaskforgeError::IllegalState { .. }
    ));

    // delete refuses a running task
    app.repo
        .update_task(task.task_id, |t| t.status = TaskStatus::Running)
        .unwrap();
    assert!(matches!(
        app.scheduler.delete_task(task.task_id).unwrap_err(),
        TaskforgeError::IllegalState { .. }
    ));
    // trigger refuses a running task
    assert!(matches!(
        app.scheduler.trigger_task(task.task_id).unwrap_err(),
        TaskforgeError::IllegalState { .. }
    ));

    // missing ids surface NotFound
    assert!(matches!(
        app.scheduler.delete_task(999).unwrap_err(),
        TaskforgeError::TaskNotFound(999)
    ));
}

#[tokio::test]
async fn update_task_patches_fields_and_recomputes_schedule() {
    init_tracing();
    let (_dir, app) = app_with(FakeCondaBackend::new());

    let mut request = ScheduleRequest::new("/opt/jobs/a.py", "e1");
    request.delay_seconds = Some(3600);
    let task = app.scheduler.schedule_task(request).await.unwrap();

    let patch = TaskPatch {
        priority: Some(Priority::High),
        cron_expression: Some(Some("*/10 * * * *".to_string())),
        memory_limit: Some(Some(512)),
        ..TaskPatch::default()
    };
    let updated = app.scheduler.update_task(task.task_id, patch).unwrap();

    assert_eq!(updated.priority, Priority::High);
    assert_eq!(updated.memory_limit, Some(512));
    assert_eq!(updated.cron_expression.as_deref(), Some("*/10 * * * *"));
    // The schedule change replaced the one-hour delay with the next firing.
    assert!(updated.next_run_time.unwrap() <= Utc::now() + Duration::seconds(600));

    // cron + delay in one patch is rejected
    let conflict = TaskPatch {
        cron_expression: Some(Some("* * * * *".to_string())),
        delay_seconds: Some(5),
        ..TaskPatch::default()
    };
    assert!(matches!(
        app.scheduler.update_task(task.task_id, conflict).unwrap_err(),
        TaskforgeError::InvalidArgs(_)
    ));

    // renaming into an existing name is rejected
    let mut other = ScheduleRequest::new("/opt/jobs/b.py", "e1");
    other.task_name = Some("other".to_string());
    app.scheduler.schedule_task(other).await.unwrap();

    let rename = TaskPatch {
        task_name: Some("other".to_string()),
        ..TaskPatch::default()
    };
    assert!(matches!(
        app.scheduler.update_task(task.task_id, rename).unwrap_err(),
        TaskforgeError::AlreadyExists(_)
    ));
}

#[tokio::test]
async fn stats_report_covers_the_task_set() {
    init_tracing();
    let (_dir, app) = app_with(FakeCondaBackend::new());

    let mut request = ScheduleRequest::new("/opt/jobs/a.py", "e1");
    request.delay_seconds = Some(3600);
    app.scheduler.schedule_task(request).await.unwrap();

    let report = app.scheduler.stats();
    assert_eq!(report.counts.total, 1);
    assert_eq!(report.counts.scheduled, 1);
    assert_eq!(report.upcoming_tasks.len(), 1);
    assert_eq!(report.memory_24h.timestamps.len(), 24);

    // The report was snapshotted to the stats file.
    let snapshot: Option<serde_json::Value> = app.persistence.load_tasks_stats().unwrap();
    assert!(snapshot.is_some());
}

#[test]
fn due_tasks_order_by_priority_then_next_run_time() {
    let now = Utc::now();
    let mut due = vec![
        TaskBuilder::new(1, "low")
            .priority(Priority::Low)
            .next_run_at(now - Duration::seconds(30))
            .build(),
        TaskBuilder::new(2, "normal")
            .priority(Priority::Normal)
            .next_run_at(now - Duration::seconds(20))
            .build(),
        TaskBuilder::new(3, "high-late")
            .priority(Priority::High)
            .next_run_at(now - Duration::seconds(5))
            .build(),
        TaskBuilder::new(4, "high-early")
            .priority(Priority::High)
            .next_run_at(now - Duration::seconds(25))
            .build(),
    ];

    order_due_tasks(&mut due);

    let names: Vec<&str> = due.iter().map(|t| t.task_name.as_str()).collect();
    assert_eq!(names, vec!["high-early", "high-late", "normal", "low"]);
}
