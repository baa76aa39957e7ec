// src/sched/envprep.rs

//! Environment provisioning during task admission.
//!
//! When a task carries requirements, they are either installed into the
//! environment it names (`reuse_env = true`, which must exist) or into a
//! freshly created environment whose name is the first unused of
//! `name, name_1, name_2, ...`. A failed install into a fresh environment
//! deletes it again; the finally-used name is substituted into the task.

use tracing::{info, warn};

use crate::conda::EnvironmentManager;
use crate::errors::{Result, TaskforgeError};

/// How provisioning resolved the environment for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    /// The environment the task will actually reference.
    pub env_name: String,
    pub installed_packages: Vec<String>,
    /// True when a fresh environment was created for this task.
    pub created: bool,
}

/// Non-empty, non-comment lines of a requirements document.
pub fn parse_requirements(requirements: &str) -> Vec<String> {
    requirements
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Provision the environment for a task being admitted.
///
/// Returns `None` when the request carries no requirements (nothing to do).
pub async fn provision(
    envs: &EnvironmentManager,
    conda_env: &str,
    requirements: Option<&str>,
    reuse_env: bool,
) -> Result<Option<ProvisionOutcome>> {
    let Some(requirements) = requirements.filter(|r| !r.trim().is_empty()) else {
        return Ok(None);
    };

    let packages = parse_requirements(requirements);
    if packages.is_empty() {
        return Err(TaskforgeError::InvalidArgs(
            "requirements contain no installable packages".to_string(),
        ));
    }

    if reuse_env {
        if !envs.exists(conda_env).await? {
            return Err(TaskforgeError::EnvMissing(conda_env.to_string()));
        }
        envs.install_unchecked(conda_env, &packages).await?;
        info!(env = conda_env, count = packages.len(), "requirements installed into existing environment");
        return Ok(Some(ProvisionOutcome {
            env_name: conda_env.to_string(),
            installed_packages: packages,
            created: false,
        }));
    }

    let env_name = envs.first_unused_name(conda_env).await?;
    envs.create(&env_name, None, &[]).await?;

    if let Err(err) = envs.install_unchecked(&env_name, &packages).await {
        // Roll back the environment we just created.
        if let Err(cleanup_err) = envs.delete(&env_name).await {
            warn!(env = %env_name, error = %cleanup_err, "rollback of fresh environment failed");
        }
        return Err(err);
    }

    info!(env = %env_name, count = packages.len(), "fresh environment created with requirements");
    Ok(Some(ProvisionOutcome {
        env_name,
        installed_packages: packages,
        created: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blanks_are_skipped() {
        let text = "# deps\nnumpy==1.26\n\n  pandas\n# trailing\n";
        assert_eq!(
            parse_requirements(text),
            vec!["numpy==1.26".to_string(), "pandas".to_string()]
        );
    }

    #[test]
    fn empty_document_yields_no_packages() {
        assert!(parse_requirements("\n# only comments\n").is_empty());
    }
}
