// src/conda/manager.rs

//! Environment lifecycle and metadata, layered over a [`CondaBackend`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};

use crate::conda::CondaBackend;
use crate::errors::{Result, TaskRef, TaskforgeError};
use crate::model::EnvironmentRecord;
use crate::persist::Persistence;
use crate::repo::TaskRepository;

/// Usage summary for one environment.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnvironmentUsage {
    pub name: String,
    pub python_version: Option<String>,
    pub package_count: usize,
    /// Live tasks referencing this environment.
    pub task_count: usize,
}

/// Roll-up across all environments.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnvironmentStats {
    pub total_environments: usize,
    pub in_use_environments: usize,
    pub environments: Vec<EnvironmentUsage>,
}

pub struct EnvironmentManager {
    backend: Box<dyn CondaBackend>,
    persistence: Arc<Persistence>,
    repo: Arc<TaskRepository>,
    metadata: Mutex<HashMap<String, EnvironmentRecord>>,
}

impl EnvironmentManager {
    /// Load persisted environment metadata and wrap the given backend.
    pub fn load(
        backend: Box<dyn CondaBackend>,
        persistence: Arc<Persistence>,
        repo: Arc<TaskRepository>,
    ) -> Result<Self> {
        let metadata = persistence.load_all_env_info()?;
        if !metadata.is_empty() {
            info!(count = metadata.len(), "loaded persisted environment metadata");
        }
        Ok(Self {
            backend,
            persistence,
            repo,
            metadata: Mutex::new(metadata),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, EnvironmentRecord>> {
        self.metadata.lock().expect("environment metadata lock poisoned")
    }

    fn save_metadata(&self, record: EnvironmentRecord) {
        if let Err(err) = self.persistence.save_env_info(&record) {
            warn!(env = %record.name, error = %err, "failed to persist environment metadata");
        }
        self.lock().insert(record.name.clone(), record);
    }

    fn drop_metadata(&self, name: &str) {
        self.lock().remove(name);
        if let Err(err) = self.persistence.remove_env_info(name) {
            warn!(env = name, error = %err, "failed to remove environment metadata");
        }
    }

    /// Cached metadata for one environment.
    pub fn get(&self, name: &str) -> Option<EnvironmentRecord> {
        self.lock().get(name).cloned()
    }

    /// Whether the backend knows an environment of this name.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let envs = self.backend.list_envs().await?;
        Ok(envs.iter().any(|e| e == name))
    }

    /// `(in_use, referencing task summaries)` from the repository.
    pub fn check_in_use(&self, name: &str) -> (bool, Vec<TaskRef>) {
        let referencing = self.repo.tasks_referencing_env(name);
        (!referencing.is_empty(), referencing)
    }

    fn ensure_not_in_use(&self, name: &str) -> Result<()> {
        let (in_use, referencing) = self.check_in_use(name);
        if in_use {
            return Err(TaskforgeError::InUse {
                name: name.to_string(),
                referencing,
            });
        }
        Ok(())
    }

    /// List environments known to the backend, reconciling the metadata
    /// cache: stale entries are dropped, newly discovered environments are
    /// probed and recorded.
    pub async fn list(&self) -> Result<Vec<EnvironmentRecord>> {
        let names = self.backend.list_envs().await?;

        let stale: Vec<String> = {
            let cache = self.lock();
            cache
                .keys()
                .filter(|known| !names.iter().any(|n| n == *known))
                .cloned()
                .collect()
        };
        for name in stale {
            info!(env = %name, "dropping metadata for vanished environment");
            self.drop_metadata(&name);
        }

        for name in &names {
            if self.get(name).is_none() {
                let probe = self.backend.probe_env(name).await.unwrap_or_default();
                info!(env = %name, "recording metadata for discovered environment");
                self.save_metadata(EnvironmentRecord::new(
                    name.clone(),
                    probe.python_version,
                    probe.packages,
                    Utc::now(),
                ));
            }
        }

        let cache = self.lock();
        let mut records: Vec<EnvironmentRecord> = names
            .iter()
            .filter_map(|name| cache.get(name).cloned())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Create a new environment and record its resolved metadata.
    pub async fn create(
        &self,
        name: &str,
        python_version: Option<&str>,
        packages: &[String],
    ) -> Result<EnvironmentRecord> {
        if self.exists(name).await? {
            return Err(TaskforgeError::AlreadyExists(format!("environment '{name}'")));
        }

        self.backend.create_env(name, python_version, packages).await?;

        let probe = self.backend.probe_env(name).await.unwrap_or_default();
        let record = EnvironmentRecord::new(
            name,
            probe.python_version.or_else(|| python_version.map(str::to_string)),
            probe.packages,
            Utc::now(),
        );
        self.save_metadata(record.clone());

        info!(env = name, "environment created");
        Ok(record)
    }

    /// Delete an environment nothing references any more.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.ensure_not_in_use(name)?;
        if !self.exists(name).await? {
            return Err(TaskforgeError::EnvMissing(name.to_string()));
        }

        self.backend.remove_env(name).await?;
        self.drop_metadata(name);

        info!(env = name, "environment deleted");
        Ok(())
    }

    /// Rename an environment, rewriting every task reference.
    ///
    /// Rename of an in-use environment is allowed: the reverse index is
    /// rewritten in one repository critical section right after the backend
    /// rename succeeds.
    pub async fn rename(&self, old: &str, new: &str) -> Result<usize> {
        if !self.exists(old).await? {
            return Err(TaskforgeError::EnvMissing(old.to_string()));
        }
        if self.exists(new).await? {
            return Err(TaskforgeError::AlreadyExists(format!("environment '{new}'")));
        }

        self.backend.rename_env(old, new).await?;
        let updated_tasks = self.repo.rewrite_env_references(old, new)?;

        if let Some(mut record) = self.get(old) {
            record.name = new.to_string();
            record.updated_at = Utc::now();
            self.save_metadata(record);
            self.drop_metadata(old);
        }

        info!(old, new, updated_tasks, "environment renamed");
        Ok(updated_tasks)
    }

    /// Install packages into an environment no live task references.
    pub async fn install_packages(&self, name: &str, packages: &[String]) -> Result<()> {
        self.ensure_not_in_use(name)?;
        self.install_unchecked(name, packages).await
    }

    /// Install without the in-use guard.
    ///
    /// Used by task admission when `reuse_env` installs requirements into
    /// the environment the task itself is about to reference.
    pub(crate) async fn install_unchecked(&self, name: &str, packages: &[String]) -> Result<()> {
        if !self.exists(name).await? {
            return Err(TaskforgeError::EnvMissing(name.to_string()));
        }

        self.backend.install_packages(name, packages).await?;
        self.refresh_metadata(name).await;

        info!(env = name, count = packages.len(), "packages installed");
        Ok(())
    }

    /// Remove packages from an environment no live task references.
    pub async fn remove_packages(&self, name: &str, packages: &[String]) -> Result<()> {
        self.ensure_not_in_use(name)?;
        if !self.exists(name).await? {
            return Err(TaskforgeError::EnvMissing(name.to_string()));
        }

        self.backend.remove_packages(name, packages).await?;
        self.refresh_metadata(name).await;

        info!(env = name, count = packages.len(), "packages removed");
        Ok(())
    }

    async fn refresh_metadata(&self, name: &str) {
        let probe = match self.backend.probe_env(name).await {
            Ok(probe) => probe,
            Err(err) => {
                warn!(env = name, error = %err, "failed to probe environment after mutation");
                return;
            }
        };

        let record = match self.get(name) {
            Some(mut record) => {
                record.python_version = probe.python_version.or(record.python_version);
                record.packages = probe.packages;
                record.updated_at = Utc::now();
                record
            }
            None => EnvironmentRecord::new(name, probe.python_version, probe.packages, Utc::now()),
        };
        self.save_metadata(record);
    }

    /// Roll-up over the known environments, snapshotted to the conda stats
    /// file on a best-effort basis.
    pub async fn environment_stats(&self) -> Result<EnvironmentStats> {
        let records = self.list().await?;

        let environments: Vec<EnvironmentUsage> = records
            .iter()
            .map(|record| {
                let referencing = self.repo.tasks_referencing_env(&record.name);
                EnvironmentUsage {
                    name: record.name.clone(),
                    python_version: record.python_version.clone(),
                    package_count: record.packages.len(),
                    task_count: referencing.len(),
                }
            })
            .collect();

        let stats = EnvironmentStats {
            total_environments: environments.len(),
            in_use_environments: environments.iter().filter(|e| e.task_count > 0).count(),
            environments,
        };

        if let Err(err) = self.persistence.save_conda_stats(&stats) {
            warn!(error = %err, "failed to snapshot environment stats");
        }
        Ok(stats)
    }

    /// First unused name in `base, base_1, base_2, ...`.
    pub async fn first_unused_name(&self, base: &str) -> Result<String> {
        let envs = self.backend.list_envs().await?;
        if !envs.iter().any(|e| e == base) {
            return Ok(base.to_string());
        }
        let mut suffix = 1usize;
        loop {
            let candidate = format!("{base}_{suffix}");
            if !envs.iter().any(|e| e == &candidate) {
                return Ok(candidate);
            }
            suffix += 1;
        }
    }
}
