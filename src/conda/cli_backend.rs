// src/conda/cli_backend.rs

//! Default [`CondaBackend`] that shells out to the `conda` executable.

use std::path::Path;
use std::process::Output;

use anyhow::{anyhow, Context};
use tokio::process::Command;
use tracing::debug;

use crate::conda::{BoxFuture, CondaBackend, EnvProbe};
use crate::errors::{Result, TaskforgeError};
use crate::model::PackageInfo;

/// Shells out to `conda` with `--json` where the output is consumed.
pub struct CondaCli {
    conda_command: String,
}

impl CondaCli {
    pub fn new(conda_command: impl Into<String>) -> Self {
        Self {
            conda_command: conda_command.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(conda = %self.conda_command, ?args, "invoking conda");
        let output = Command::new(&self.conda_command)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawning {} {}", self.conda_command, args.join(" ")))?;
        Ok(output)
    }

    /// Run a mutating conda command, mapping failures to error kinds.
    async fn run_checked(&self, args: &[&str]) -> Result<()> {
        let output = self.run(args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let missing = parse_missing_packages(&stderr);
        if !missing.is_empty() {
            return Err(TaskforgeError::PackageNotFound { missing });
        }
        Err(anyhow!("conda {} failed: {}", args.join(" "), stderr.trim()).into())
    }
}

impl CondaBackend for CondaCli {
    fn list_envs(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let output = self.run(&["info", "--json"]).await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(anyhow!("conda info failed: {}", stderr.trim()).into());
            }

            let info: serde_json::Value =
                serde_json::from_slice(&output.stdout).context("parsing conda info output")?;
            let root_prefix = info["root_prefix"].as_str().map(str::to_string);

            let envs = info["envs"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str())
                        .filter(|path| Some(*path) != root_prefix.as_deref())
                        .filter_map(|path| {
                            Path::new(path)
                                .file_name()
                                .and_then(|n| n.to_str())
                                .map(str::to_string)
                        })
                        .collect()
                })
                .unwrap_or_default();

            Ok(envs)
        })
    }

    fn create_env<'a>(
        &'a self,
        name: &'a str,
        python_version: Option<&'a str>,
        packages: &'a [String],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut args = vec![
                "create".to_string(),
                "--name".to_string(),
                name.to_string(),
                "--yes".to_string(),
            ];
            if let Some(version) = python_version {
                args.push(format!("python={version}"));
            }
            args.extend(packages.iter().cloned());

            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            self.run_checked(&arg_refs).await
        })
    }

    fn remove_env<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.run_checked(&["env", "remove", "--name", name, "--yes"])
                .await
        })
    }

    fn rename_env<'a>(&'a self, old: &'a str, new: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.run_checked(&["rename", "--name", old, new, "--yes"])
                .await
        })
    }

    fn install_packages<'a>(
        &'a self,
        name: &'a str,
        packages: &'a [String],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut args = vec!["install", "--name", name, "--yes"];
            args.extend(packages.iter().map(String::as_str));
            self.run_checked(&args).await
        })
    }

    fn remove_packages<'a>(
        &'a self,
        name: &'a str,
        packages: &'a [String],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut args = vec!["remove", "--name", name, "--yes"];
            args.extend(packages.iter().map(String::as_str));
            self.run_checked(&args).await
        })
    }

    fn probe_env<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<EnvProbe>> {
        Box::pin(async move {
            let output = self.run(&["list", "--name", name, "--json"]).await?;
            if !output.status.success() {
                // A probe failure leaves the metadata sparse, not the whole
                // operation failed.
                return Ok(EnvProbe::default());
            }

            let listed: Vec<serde_json::Value> =
                serde_json::from_slice(&output.stdout).context("parsing conda list output")?;

            let packages: Vec<PackageInfo> = listed
                .iter()
                .filter_map(|pkg| {
                    Some(PackageInfo {
                        name: pkg["name"].as_str()?.to_string(),
                        version: pkg["version"].as_str()?.to_string(),
                    })
                })
                .collect();

            let python_version = packages
                .iter()
                .find(|p| p.name == "python")
                .map(|p| major_minor(&p.version));

            Ok(EnvProbe {
                python_version,
                packages,
            })
        })
    }
}

/// `3.11.4` -> `3.11`.
fn major_minor(version: &str) -> String {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() >= 2 {
        format!("{}.{}", parts[0], parts[1])
    } else {
        version.to_string()
    }
}

/// Pull the offending package names out of a `PackagesNotFoundError` block.
///
/// conda lists them as indented `- <spec>` lines.
fn parse_missing_packages(stderr: &str) -> Vec<String> {
    if !stderr.contains("PackagesNotFoundError") && !stderr.contains("PackageNotFoundError") {
        return Vec::new();
    }
    stderr
        .lines()
        .filter_map(|line| line.trim().strip_prefix("- "))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_packages_are_extracted() {
        let stderr = "\
PackagesNotFoundError: The following packages are not available from current channels:

  - nosuchpkg==1.0
  - otherpkg
";
        assert_eq!(
            parse_missing_packages(stderr),
            vec!["nosuchpkg==1.0".to_string(), "otherpkg".to_string()]
        );
    }

    #[test]
    fn unrelated_stderr_yields_no_packages() {
        assert!(parse_missing_packages("CondaHTTPError: timeout").is_empty());
    }

    #[test]
    fn python_version_is_truncated_to_major_minor() {
        assert_eq!(major_minor("3.11.4"), "3.11");
        assert_eq!(major_minor("3"), "3");
    }
}
