// src/conda/mod.rs

//! Conda environment management.
//!
//! The manager owns per-environment metadata and the tasks-by-environment
//! reverse index; the actual `conda` side effects sit behind the
//! [`CondaBackend`] trait so tests can swap in a fake, the same way the
//! process executor is swapped in the rest of the daemon.

use std::future::Future;
use std::pin::Pin;

use crate::errors::Result;
use crate::model::PackageInfo;

pub mod cli_backend;
pub mod manager;

pub use cli_backend::CondaCli;
pub use manager::{EnvironmentManager, EnvironmentStats, EnvironmentUsage};

/// Boxed future returned by backend methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a backend can report about one environment.
#[derive(Debug, Clone, Default)]
pub struct EnvProbe {
    /// `major.minor` of the interpreter, when one is installed.
    pub python_version: Option<String>,
    pub packages: Vec<PackageInfo>,
}

/// Trait abstracting the conda CLI.
///
/// Production code uses [`CondaCli`]; tests provide an implementation that
/// tracks environments in memory. Implementations must be safe against
/// concurrent calls on *different* environment names; the core invokes at
/// most one operation at a time per name.
pub trait CondaBackend: Send + Sync {
    /// Names of all environments, excluding the base environment.
    fn list_envs(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Create an environment, optionally pinning a Python version and
    /// seeding packages. Package resolution failures surface as
    /// `PackageNotFound`.
    fn create_env<'a>(
        &'a self,
        name: &'a str,
        python_version: Option<&'a str>,
        packages: &'a [String],
    ) -> BoxFuture<'a, Result<()>>;

    fn remove_env<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;

    fn rename_env<'a>(&'a self, old: &'a str, new: &'a str) -> BoxFuture<'a, Result<()>>;

    fn install_packages<'a>(
        &'a self,
        name: &'a str,
        packages: &'a [String],
    ) -> BoxFuture<'a, Result<()>>;

    fn remove_packages<'a>(
        &'a self,
        name: &'a str,
        packages: &'a [String],
    ) -> BoxFuture<'a, Result<()>>;

    /// Resolve the interpreter version and installed package list.
    fn probe_env<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<EnvProbe>>;
}
