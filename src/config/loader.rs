// src/config/loader.rs

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::cli::CliArgs;
use crate::config::model::SettingsFile;
use crate::config::validate::validate_settings;
use crate::config::Settings;

/// Load a settings file from a given path and return the raw `SettingsFile`.
///
/// A missing file is not an error: the daemon runs with built-in defaults,
/// the same way it would with an empty TOML file.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<SettingsFile> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(SettingsFile::default());
    }

    let contents =
        fs::read_to_string(path).with_context(|| format!("reading settings file at {path:?}"))?;

    let settings: SettingsFile = toml::from_str(&contents)
        .with_context(|| format!("parsing TOML settings from {path:?}"))?;

    Ok(settings)
}

/// Load settings, apply CLI overrides and run basic validation.
///
/// This is the entry point used by `run()`:
/// - reads TOML (defaults for anything absent),
/// - lets `--state-dir` / `--conda` override the file,
/// - checks the resolved values for sanity.
pub fn load_and_validate(args: &CliArgs) -> Result<Settings> {
    let file = load_from_path(&args.config)?;

    let mut settings = Settings::from_file(file);
    if let Some(dir) = &args.state_dir {
        settings.state_dir = dir.clone();
    }
    if let Some(conda) = &args.conda {
        settings.conda_command = conda.clone();
    }

    validate_settings(&settings)?;
    Ok(settings)
}
