//! Argument definitions for the `status` subcommand.

use clap::Args;

/// Query a running coordinator for its statistics.
#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Coordinator address as `host:port`.
    #[arg(value_name = "HOST:PORT")]
    pub address: String,

    /// Print raw JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}
