// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for the `taskforge` daemon.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "taskforge",
    version,
    about = "Schedule and supervise Python tasks inside Conda environments.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the settings file (TOML).
    ///
    /// Default: `Taskforge.toml` in the current working directory; missing
    /// file means built-in defaults.
    #[arg(long, value_name = "PATH", default_value = "Taskforge.toml")]
    pub config: String,

    /// State directory holding config/, data/ and scripts/.
    ///
    /// Overrides `daemon.state_dir` from the settings file.
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Conda executable to invoke for environment operations and task runs.
    #[arg(long, value_name = "BIN")]
    pub conda: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TASKFORGE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Take a timestamped backup of config and data on startup.
    #[arg(long)]
    pub backup_on_start: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
