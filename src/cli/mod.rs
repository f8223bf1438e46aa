//! Command-line interface for the TaskForge coordinator.
//!
//! This module provides the top-level CLI application structure and
//! subcommands for running ad-hoc commands through a coordinator, querying a
//! running coordinator's statistics, and generating shell completions.
//!
//! # Architecture
//!
//! The CLI is built using `clap` and follows a subcommand pattern:
//! - `run` - start a coordinator, submit the given commands, wait for results
//! - `status` - query a running coordinator for its statistics
//! - `generate-completion` - shell completion script generation
//!
//! # Examples
//!
//! ```bash
//! # Run two commands on whatever workers connect
//! taskforge run "gzip -9 data.raw" "sha256sum data.raw" --port 9123
//!
//! # Inspect a running coordinator
//! taskforge status localhost:9123
//! ```

mod generate_completion_args;
mod run_args;
mod status_args;
pub mod table;

use clap::{CommandFactory, Parser, Subcommand};
pub use generate_completion_args::GenerateCompletionArgs;
pub use run_args::RunArgs;
pub use status_args::StatusArgs;

use crate::Result;

/// Main CLI application structure defining the top-level interface.
#[derive(Parser, Debug)]
#[command(name = "taskforge")]
#[command(about = "Distributed task-execution coordinator")]
#[command(version = crate::VERSION)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run shell commands as tasks on connected workers.
    Run(RunArgs),
    /// Query a running coordinator for statistics.
    Status(StatusArgs),
    /// Generate a shell completion script.
    GenerateCompletion(GenerateCompletionArgs),
}

/// Parse arguments and dispatch to the selected command.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => crate::commands::run_command::execute(args).await,
        Commands::Status(args) => crate::commands::status_command::execute(args).await,
        Commands::GenerateCompletion(args) => {
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "taskforge", &mut std::io::stdout());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_with_options() {
        let cli = Cli::parse_from([
            "taskforge",
            "run",
            "--port",
            "9200",
            "--cores",
            "2",
            "echo hello",
        ]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.port, Some(9200));
                assert_eq!(args.cores, Some(2));
                assert_eq!(args.commands, vec!["echo hello"]);
            }
            _ => panic!("expected run subcommand"),
        }
    }

    #[test]
    fn cli_parses_status() {
        let cli = Cli::parse_from(["taskforge", "status", "localhost:9123", "--json"]);
        match cli.command {
            Commands::Status(args) => {
                assert_eq!(args.address, "localhost:9123");
                assert!(args.json);
            }
            _ => panic!("expected status subcommand"),
        }
    }

    #[test]
    fn cli_requires_a_command_for_run() {
        assert!(Cli::try_parse_from(["taskforge", "run"]).is_err());
    }
}
