// src/config/mod.rs

//! Daemon settings: TOML model, loader and validation.

use std::path::PathBuf;
use std::time::Duration;

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::load_and_validate;
pub use model::SettingsFile;

/// Fully resolved runtime settings (file values + CLI overrides).
///
/// A snapshot of these is persisted to `config/system_config.json` at
/// startup so operators can see what a running daemon resolved to.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Settings {
    pub state_dir: PathBuf,
    pub conda_command: String,
    pub tick_interval_ms: u64,
    pub history_retention_days: i64,
    pub backup_retention_days: i64,
}

impl Settings {
    pub fn from_file(file: SettingsFile) -> Self {
        let d = file.daemon;
        Self {
            state_dir: d.state_dir,
            conda_command: d.conda_command,
            tick_interval_ms: d.tick_interval_ms,
            history_retention_days: d.history_retention_days,
            backup_retention_days: d.backup_retention_days,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::from_file(SettingsFile::default())
    }
}
