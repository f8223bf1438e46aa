//! Argument definitions for the `run` subcommand.

use clap::Args;
use std::path::PathBuf;

/// Run a coordinator and execute ad-hoc shell commands on connected workers.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Shell commands, one task each.
    #[arg(required = true, value_name = "COMMAND")]
    pub commands: Vec<String>,

    /// Exact listening port (0 scans the configured range).
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Project name announced to the catalog.
    #[arg(long, short = 'N')]
    pub name: Option<String>,

    /// Category label for the submitted tasks.
    #[arg(long, default_value = "default")]
    pub category: String,

    /// Cores requested per task.
    #[arg(long)]
    pub cores: Option<i64>,

    /// Memory requested per task, in MB.
    #[arg(long)]
    pub memory: Option<i64>,

    /// Per-attempt wall-time limit, in seconds.
    #[arg(long)]
    pub wall_time: Option<u64>,

    /// Shared-secret file workers must authenticate against.
    #[arg(long)]
    pub password_file: Option<PathBuf>,

    /// Write a performance log to this path.
    #[arg(long)]
    pub perf_log: Option<PathBuf>,

    /// Write a transaction log to this path.
    #[arg(long)]
    pub transaction_log: Option<PathBuf>,

    /// Overall timeout waiting for all tasks, in seconds.
    #[arg(long, default_value_t = 3600)]
    pub timeout: u64,
}
