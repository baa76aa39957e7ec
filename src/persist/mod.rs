// src/persist/mod.rs

//! Atomic, versioned JSON persistence for the daemon's state tree.
//!
//! Layout, rooted at the configurable state dir (default `/var/taskforge`):
//!
//! ```text
//! <state>/config/tasks.json
//! <state>/config/system_config.json
//! <state>/data/task_history/<task_id>.json
//! <state>/data/env_info/<env_name>.json
//! <state>/data/stats/{tasks_stats,conda_stats}.json
//! <state>/data/backup_<yyyymmdd_HHMMSS>/...
//! <state>/scripts/<task_id>/<filename>
//! <state>/scripts/git_scripts/<task_id>/...
//! ```
//!
//! Every file is wrapped in a `{"__version__", data, updated_at}` envelope
//! and written via temp-file + rename, so readers never observe a partial
//! write. Readers tolerate the legacy unversioned shape by treating the
//! whole document as `data`.

mod scripts;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::model::{EnvironmentRecord, ExecutionRecord};
use crate::types::TaskId;

pub use scripts::ZipUnpackResult;

const CURRENT_VERSION: &str = "1.0.0";

const CONFIG_DIR: &str = "config";
const DATA_DIR: &str = "data";
const SCRIPTS_DIR: &str = "scripts";
const TASK_HISTORY_DIR: &str = "task_history";
const ENV_INFO_DIR: &str = "env_info";
const STATS_DIR: &str = "stats";
const GIT_SCRIPTS_DIR: &str = "git_scripts";

const TASKS_CONFIG_FILE: &str = "tasks.json";
const SYSTEM_CONFIG_FILE: &str = "system_config.json";
const TASKS_STATS_FILE: &str = "tasks_stats.json";
const CONDA_STATS_FILE: &str = "conda_stats.json";

/// Versioned envelope written around every persisted document.
#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "__version__")]
    version: &'static str,
    data: &'a T,
    updated_at: i64,
}

/// Single instance that serialises all persistence access.
pub struct Persistence {
    state_dir: PathBuf,
    io_lock: Mutex<()>,
}

impl Persistence {
    /// Create the persistence layer and ensure the directory tree exists.
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        let this = Self {
            state_dir,
            io_lock: Mutex::new(()),
        };
        this.ensure_directories()?;
        Ok(this)
    }

    fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.config_dir(),
            self.task_history_dir(),
            self.env_info_dir(),
            self.stats_dir(),
            self.scripts_dir(),
            self.git_scripts_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating state directory {dir:?}"))?;
        }
        info!(state_dir = %self.state_dir.display(), "state directories initialised");
        Ok(())
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn config_dir(&self) -> PathBuf {
        self.state_dir.join(CONFIG_DIR)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.state_dir.join(DATA_DIR)
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.state_dir.join(SCRIPTS_DIR)
    }

    pub fn task_history_dir(&self) -> PathBuf {
        self.data_dir().join(TASK_HISTORY_DIR)
    }

    pub fn env_info_dir(&self) -> PathBuf {
        self.data_dir().join(ENV_INFO_DIR)
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.data_dir().join(STATS_DIR)
    }

    pub fn git_scripts_dir(&self) -> PathBuf {
        self.scripts_dir().join(GIT_SCRIPTS_DIR)
    }

    /// Directory holding the uploaded script(s) of one task.
    pub fn task_scripts_dir(&self, task_id: TaskId) -> PathBuf {
        self.scripts_dir().join(task_id.to_string())
    }

    // ---- generic envelope IO ------------------------------------------------

    /// Serialise `data` inside the version envelope and atomically replace
    /// `path` (write `<path>.tmp`, then rename).
    fn write_atomic<T: Serialize>(&self, path: &Path, data: &T) -> Result<()> {
        let _guard = self.io_lock.lock().expect("persistence lock poisoned");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating parent directory for {path:?}"))?;
        }

        let envelope = Envelope {
            version: CURRENT_VERSION,
            data,
            updated_at: Utc::now().timestamp(),
        };
        let payload = serde_json::to_vec_pretty(&envelope)
            .with_context(|| format!("serialising payload for {path:?}"))?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &payload)
            .with_context(|| format!("writing temp file {tmp_path:?}"))?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming {tmp_path:?} over {path:?}"))?;

        debug!(path = %path.display(), "persisted");
        Ok(())
    }

    /// Read a versioned document.
    ///
    /// Returns `Ok(None)` when the file is absent; a parse failure is an
    /// error. Documents without a `__version__` marker are treated as bare
    /// `data` (legacy shape).
    fn read_versioned<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let _guard = self.io_lock.lock().expect("persistence lock poisoned");

        if !path.exists() {
            return Ok(None);
        }

        let contents =
            fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
        let value: serde_json::Value = serde_json::from_str(&contents)
            .with_context(|| format!("parsing JSON from {path:?}"))?;

        let data = match value {
            serde_json::Value::Object(mut map) if map.contains_key("__version__") => map
                .remove("data")
                .with_context(|| format!("versioned file {path:?} has no data field"))?,
            other => {
                warn!(path = %path.display(), "file has no version marker; reading as raw data");
                other
            }
        };

        let parsed = serde_json::from_value(data)
            .with_context(|| format!("decoding payload of {path:?}"))?;
        Ok(Some(parsed))
    }

    // ---- task configuration -------------------------------------------------

    pub fn save_tasks_config<T: Serialize>(&self, data: &T) -> Result<()> {
        self.write_atomic(&self.config_dir().join(TASKS_CONFIG_FILE), data)
    }

    pub fn load_tasks_config<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.read_versioned(&self.config_dir().join(TASKS_CONFIG_FILE))
    }

    pub fn save_system_config<T: Serialize>(&self, data: &T) -> Result<()> {
        self.write_atomic(&self.config_dir().join(SYSTEM_CONFIG_FILE), data)
    }

    pub fn load_system_config<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.read_versioned(&self.config_dir().join(SYSTEM_CONFIG_FILE))
    }

    // ---- per-task history ---------------------------------------------------

    fn task_history_path(&self, task_id: TaskId) -> PathBuf {
        self.task_history_dir().join(format!("{task_id}.json"))
    }

    pub fn save_task_history(&self, task_id: TaskId, records: &[ExecutionRecord]) -> Result<()> {
        self.write_atomic(&self.task_history_path(task_id), &records)
    }

    pub fn load_task_history(&self, task_id: TaskId) -> Result<Option<Vec<ExecutionRecord>>> {
        self.read_versioned(&self.task_history_path(task_id))
    }

    /// Load the history of every task with a file on disk.
    ///
    /// Files whose name is not a task id, or whose payload fails to decode,
    /// are skipped with a warning rather than failing the whole load.
    pub fn load_all_task_histories(&self) -> Result<HashMap<TaskId, Vec<ExecutionRecord>>> {
        let dir = self.task_history_dir();
        let mut result = HashMap::new();
        if !dir.exists() {
            return Ok(result);
        }

        for entry in fs::read_dir(&dir).with_context(|| format!("listing {dir:?}"))? {
            let entry = entry.with_context(|| format!("listing {dir:?}"))?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(task_id) = stem.parse::<TaskId>() else {
                warn!(file = %path.display(), "skipping history file with non-numeric name");
                continue;
            };
            match self.read_versioned::<Vec<ExecutionRecord>>(&path) {
                Ok(Some(records)) => {
                    result.insert(task_id, records);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "skipping unreadable history file");
                }
            }
        }

        Ok(result)
    }

    // ---- per-environment metadata -------------------------------------------

    fn env_info_path(&self, env_name: &str) -> PathBuf {
        self.env_info_dir().join(format!("{env_name}.json"))
    }

    pub fn save_env_info(&self, record: &EnvironmentRecord) -> Result<()> {
        self.write_atomic(&self.env_info_path(&record.name), record)
    }

    pub fn load_env_info(&self, env_name: &str) -> Result<Option<EnvironmentRecord>> {
        self.read_versioned(&self.env_info_path(env_name))
    }

    pub fn remove_env_info(&self, env_name: &str) -> Result<()> {
        let _guard = self.io_lock.lock().expect("persistence lock poisoned");
        let path = self.env_info_path(env_name);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("removing {path:?}"))?;
        }
        Ok(())
    }

    pub fn load_all_env_info(&self) -> Result<HashMap<String, EnvironmentRecord>> {
        let dir = self.env_info_dir();
        let mut result = HashMap::new();
        if !dir.exists() {
            return Ok(result);
        }

        for entry in fs::read_dir(&dir).with_context(|| format!("listing {dir:?}"))? {
            let entry = entry.with_context(|| format!("listing {dir:?}"))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read_versioned::<EnvironmentRecord>(&path) {
                Ok(Some(record)) => {
                    result.insert(name.to_string(), record);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "skipping unreadable env metadata");
                }
            }
        }

        Ok(result)
    }

    // ---- stats snapshots ----------------------------------------------------

    pub fn save_tasks_stats<T: Serialize>(&self, stats: &T) -> Result<()> {
        self.write_atomic(&self.stats_dir().join(TASKS_STATS_FILE), stats)
    }

    pub fn load_tasks_stats<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.read_versioned(&self.stats_dir().join(TASKS_STATS_FILE))
    }

    pub fn save_conda_stats<T: Serialize>(&self, stats: &T) -> Result<()> {
        self.write_atomic(&self.stats_dir().join(CONDA_STATS_FILE), stats)
    }

    pub fn load_conda_stats<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.read_versioned(&self.stats_dir().join(CONDA_STATS_FILE))
    }

    // ---- backup / restore ---------------------------------------------------

    /// Copy the config dir and the data subdirectories into a timestamped
    /// `backup_<yyyymmdd_HHMMSS>` directory under data/. Returns its path.
    pub fn create_backup(&self) -> Result<PathBuf> {
        let _guard = self.io_lock.lock().expect("persistence lock poisoned");

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let backup_dir = self.data_dir().join(format!("backup_{stamp}"));
        fs::create_dir_all(&backup_dir)
            .with_context(|| format!("creating backup directory {backup_dir:?}"))?;

        copy_dir_recursive(&self.config_dir(), &backup_dir.join(CONFIG_DIR))?;
        for subdir in [TASK_HISTORY_DIR, ENV_INFO_DIR, STATS_DIR] {
            let src = self.data_dir().join(subdir);
            if src.exists() {
                copy_dir_recursive(&src, &backup_dir.join(subdir))?;
            }
        }

        info!(backup = %backup_dir.display(), "backup created");
        Ok(backup_dir)
    }

    /// Replace the live config and data subdirectories with the contents of
    /// a previously created backup directory.
    pub fn restore_backup(&self, backup_dir: &Path) -> Result<()> {
        let _guard = self.io_lock.lock().expect("persistence lock poisoned");

        if !backup_dir.is_dir() {
            return Err(anyhow::anyhow!("backup directory {backup_dir:?} does not exist").into());
        }

        let config_backup = backup_dir.join(CONFIG_DIR);
        if config_backup.exists() {
            let live = self.config_dir();
            let _ = fs::remove_dir_all(&live);
            copy_dir_recursive(&config_backup, &live)?;
        }

        for subdir in [TASK_HISTORY_DIR, ENV_INFO_DIR, STATS_DIR] {
            let src = backup_dir.join(subdir);
            if src.exists() {
                let live = self.data_dir().join(subdir);
                let _ = fs::remove_dir_all(&live);
                copy_dir_recursive(&src, &live)?;
            }
        }

        info!(backup = %backup_dir.display(), "backup restored");
        Ok(())
    }

    /// Delete `backup_*` directories older than `keep_days`.
    pub fn clean_old_backups(&self, keep_days: i64) -> Result<usize> {
        let _guard = self.io_lock.lock().expect("persistence lock poisoned");

        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(keep_days.max(0) as u64 * 86_400);
        let mut removed = 0usize;

        let data_dir = self.data_dir();
        for entry in fs::read_dir(&data_dir).with_context(|| format!("listing {data_dir:?}"))? {
            let entry = entry.with_context(|| format!("listing {data_dir:?}"))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_dir() || !name.starts_with("backup_") {
                continue;
            }
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .with_context(|| format!("reading mtime of {path:?}"))?;
            if mtime < cutoff {
                fs::remove_dir_all(&path)
                    .with_context(|| format!("removing old backup {path:?}"))?;
                info!(backup = %path.display(), "old backup removed");
                removed += 1;
            }
        }

        Ok(removed)
    }
}

/// Recursively copy `src` into `dst`, creating directories as needed.
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("creating {dst:?}"))?;
    for entry in fs::read_dir(src).with_context(|| format!("listing {src:?}"))? {
        let entry = entry.with_context(|| format!("listing {src:?}"))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("copying {src_path:?} to {dst_path:?}"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn persistence() -> (tempfile::TempDir, Persistence) {
        let dir = tempfile::tempdir().unwrap();
        let persist = Persistence::new(dir.path()).unwrap();
        (dir, persist)
    }

    #[test]
    fn versioned_roundtrip() {
        let (_dir, persist) = persistence();
        let records = vec![ExecutionRecord::started(Uuid::new_v4(), Utc::now())];

        persist.save_task_history(7, &records).unwrap();
        let loaded = persist.load_task_history(7).unwrap().unwrap();
        assert_eq!(loaded, records);
    }

    #[test]
    fn missing_file_reads_as_absent() {
        let (_dir, persist) = persistence();
        assert!(persist.load_task_history(99).unwrap().is_none());
    }

    #[test]
    fn legacy_unversioned_shape_is_tolerated() {
        let (_dir, persist) = persistence();
        let record = ExecutionRecord::started(Uuid::new_v4(), Utc::now());
        let path = persist.task_history_path(3);
        fs::write(&path, serde_json::to_vec(&vec![record.clone()]).unwrap()).unwrap();

        let loaded = persist.load_task_history(3).unwrap().unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[test]
    fn envelope_carries_version_marker() {
        let (_dir, persist) = persistence();
        persist.save_task_history(1, &[]).unwrap();

        let raw = fs::read_to_string(persist.task_history_path(1)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["__version__"], "1.0.0");
        assert!(value["updated_at"].is_i64());
    }

    #[test]
    fn backup_and_restore_roundtrip() {
        let (_dir, persist) = persistence();
        let records = vec![ExecutionRecord::started(Uuid::new_v4(), Utc::now())];
        persist.save_task_history(1, &records).unwrap();

        let backup = persist.create_backup().unwrap();

        // Clobber the live file, then restore.
        persist.save_task_history(1, &[]).unwrap();
        persist.restore_backup(&backup).unwrap();

        let loaded = persist.load_task_history(1).unwrap().unwrap();
        assert_eq!(loaded, records);
    }
}
