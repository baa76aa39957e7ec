use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use taskforge::conda::{BoxFuture, CondaBackend, EnvProbe};
use taskforge::errors::{Result, TaskforgeError};
use taskforge::model::PackageInfo;

/// In-memory conda backend for tests.
///
/// - environments live in a map of name -> installed packages
/// - every operation is recorded in `operations` for assertions
/// - package names listed in `unresolvable` fail installation with
///   `PackageNotFound`, like a real missing package would.
#[derive(Clone, Default)]
pub struct FakeCondaBackend {
    state: Arc<Mutex<FakeCondaState>>,
}

#[derive(Default)]
pub struct FakeCondaState {
    pub envs: BTreeMap<String, Vec<PackageInfo>>,
    pub unresolvable: BTreeSet<String>,
    pub operations: Vec<String>,
}

impl FakeCondaBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create an environment.
    pub fn with_env(self, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .envs
            .insert(name.to_string(), vec![]);
        self
    }

    /// Mark a package name as unresolvable.
    pub fn with_unresolvable(self, package: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .unresolvable
            .insert(package.to_string());
        self
    }

    pub fn env_names(&self) -> Vec<String> {
        self.state.lock().unwrap().envs.keys().cloned().collect()
    }

    pub fn operations(&self) -> Vec<String> {
        self.state.lock().unwrap().operations.clone()
    }

    fn base_name(spec: &str) -> String {
        spec.split(['=', '<', '>'])
            .next()
            .unwrap_or(spec)
            .trim()
            .to_string()
    }
}

impl CondaBackend for FakeCondaBackend {
    fn list_envs(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move { Ok(state.lock().unwrap().envs.keys().cloned().collect()) })
    }

    fn create_env<'a>(
        &'a self,
        name: &'a str,
        _python_version: Option<&'a str>,
        packages: &'a [String],
    ) -> BoxFuture<'a, Result<()>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let mut state = state.lock().unwrap();
            state.operations.push(format!("create {name}"));

            let missing: Vec<String> = packages
                .iter()
                .filter(|p| state.unresolvable.contains(&Self::base_name(p)))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(TaskforgeError::PackageNotFound { missing });
            }

            let installed = packages
                .iter()
                .map(|p| PackageInfo {
                    name: Self::base_name(p),
                    version: "1.0.0".to_string(),
                })
                .collect();
            state.envs.insert(name.to_string(), installed);
            Ok(())
        })
    }

    fn remove_env<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let mut state = state.lock().unwrap();
            state.operations.push(format!("remove {name}"));
            state.envs.remove(name);
            Ok(())
        })
    }

    fn rename_env<'a>(&'a self, old: &'a str, new: &'a str) -> BoxFuture<'a, Result<()>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let mut state = state.lock().unwrap();
            state.operations.push(format!("rename {old} {new}"));
            if let Some(packages) = state.envs.remove(old) {
                state.envs.insert(new.to_string(), packages);
            }
            Ok(())
        })
    }

    fn install_packages<'a>(
        &'a self,
        name: &'a str,
        packages: &'a [String],
    ) -> BoxFuture<'a, Result<()>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let mut state = state.lock().unwrap();
            state
                .operations
                .push(format!("install {name} {}", packages.join(",")));

            let missing: Vec<String> = packages
                .iter()
                .filter(|p| state.unresolvable.contains(&Self::base_name(p)))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(TaskforgeError::PackageNotFound { missing });
            }

            let installed: Vec<PackageInfo> = packages
                .iter()
                .map(|p| PackageInfo {
                    name: Self::base_name(p),
                    version: "1.0.0".to_string(),
                })
                .collect();
            if let Some(env) = state.envs.get_mut(name) {
                env.extend(installed);
            }
            Ok(())
        })
    }

    fn remove_packages<'a>(
        &'a self,
        name: &'a str,
        packages: &'a [String],
    ) -> BoxFuture<'a, Result<()>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let mut state = state.lock().unwrap();
            state
                .operations
                .push(format!("uninstall {name} {}", packages.join(",")));

            let removed: Vec<String> = packages.iter().map(|p| Self::base_name(p)).collect();
            if let Some(env) = state.envs.get_mut(name) {
                env.retain(|pkg| !removed.contains(&pkg.name));
            }
            Ok(())
        })
    }

    fn probe_env<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<EnvProbe>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let state = state.lock().unwrap();
            let packages = state.envs.get(name).cloned().unwrap_or_default();
            let python_version = packages
                .iter()
                .find(|p| p.name == "python")
                .map(|p| p.version.clone());
            Ok(EnvProbe {
                python_version,
                packages,
            })
        })
    }
}
