// src/lib.rs

pub mod cli;
pub mod conda;
pub mod config;
pub mod errors;
pub mod exec;
pub mod history;
pub mod logging;
pub mod model;
pub mod persist;
pub mod repo;
pub mod sched;
pub mod stats;
pub mod types;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

use crate::cli::CliArgs;
use crate::conda::{CondaBackend, CondaCli, EnvironmentManager};
use crate::config::Settings;
use crate::exec::Supervisor;
use crate::history::HistoryStore;
use crate::persist::Persistence;
use crate::repo::TaskRepository;
use crate::sched::Scheduler;

/// The single owned application object: every component is constructed once
/// here and wired through explicit handles, no globals.
pub struct App {
    pub persistence: Arc<Persistence>,
    pub repo: Arc<TaskRepository>,
    pub history: Arc<HistoryStore>,
    pub envs: Arc<EnvironmentManager>,
    pub supervisor: Arc<Supervisor>,
    pub scheduler: Arc<Scheduler>,
}

impl App {
    /// Build the application with the default conda CLI backend.
    pub fn bootstrap(settings: &Settings) -> errors::Result<Self> {
        let backend = Box::new(CondaCli::new(settings.conda_command.clone()));
        Self::bootstrap_with_backend(settings, backend)
    }

    /// Build the application with an explicit environment backend (tests
    /// inject a fake here).
    pub fn bootstrap_with_backend(
        settings: &Settings,
        backend: Box<dyn CondaBackend>,
    ) -> errors::Result<Self> {
        let persistence = Arc::new(Persistence::new(settings.state_dir.clone())?);
        let repo = Arc::new(TaskRepository::load(Arc::clone(&persistence))?);
        let history = Arc::new(HistoryStore::load(Arc::clone(&persistence))?);
        let envs = Arc::new(EnvironmentManager::load(
            backend,
            Arc::clone(&persistence),
            Arc::clone(&repo),
        )?);
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&repo),
            Arc::clone(&history),
            settings.conda_command.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&repo),
            Arc::clone(&history),
            Arc::clone(&supervisor),
            Arc::clone(&envs),
            Arc::clone(&persistence),
            settings.tick_interval(),
            settings.history_retention_days,
        ));

        Ok(Self {
            persistence,
            repo,
            history,
            envs,
            supervisor,
            scheduler,
        })
    }
}

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - settings loading (TOML + CLI overrides)
/// - persistence, repository, history, environment manager
/// - supervisor + scheduler with its dispatch loop
/// - Ctrl-C handling for a graceful shutdown
pub async fn run(args: CliArgs) -> Result<()> {
    let settings = config::load_and_validate(&args)?;
    info!(state_dir = %settings.state_dir.display(), "starting taskforge daemon");

    let app = App::bootstrap(&settings)?;

    // Record what this daemon instance resolved to.
    app.persistence.save_system_config(&settings)?;

    if args.backup_on_start {
        let backup = app.persistence.create_backup()?;
        info!(backup = %backup.display(), "startup backup complete");
        app.persistence
            .clean_old_backups(settings.backup_retention_days)?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch = app.scheduler.spawn_dispatch_loop(shutdown_rx);

    // Ctrl-C → graceful shutdown.
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    dispatch.await?;

    info!("taskforge daemon exiting");
    Ok(())
}
