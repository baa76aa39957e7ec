// src/config/model.rs

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level daemon settings as read from a TOML file.
///
/// ```toml
/// [daemon]
/// state_dir = "/var/taskforge"
/// conda_command = "conda"
/// tick_interval_ms = 1000
/// history_retention_days = 30
/// backup_retention_days = 7
/// ```
///
/// All sections are optional and have reasonable defaults; a missing file is
/// treated as an entirely default configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub daemon: DaemonSection,
}

/// `[daemon]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSection {
    /// Root of the persisted state tree (config/, data/, scripts/).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Executable used for `conda run` and environment operations.
    #[serde(default = "default_conda_command")]
    pub conda_command: String,

    /// Dispatch loop wake-up interval.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Execution records older than this are pruned on each tick.
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: i64,

    /// Backups older than this are removed by `clean_old_backups`.
    #[serde(default = "default_backup_retention_days")]
    pub backup_retention_days: i64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/taskforge")
}

fn default_conda_command() -> String {
    "conda".to_string()
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_history_retention_days() -> i64 {
    30
}

fn default_backup_retention_days() -> i64 {
    7
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            conda_command: default_conda_command(),
            tick_interval_ms: default_tick_interval_ms(),
            history_retention_days: default_history_retention_days(),
            backup_retention_days: default_backup_retention_days(),
        }
    }
}
