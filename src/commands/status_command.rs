//! Implementation of the `status` subcommand.
//!
//! Connects to a running coordinator as a status client: sends the `status`
//! line and prints the JSON statistics dump that comes back, either raw or
//! rendered as a table.

use crate::Result;
use crate::cli::StatusArgs;
use crate::cli::table::create_stats_table;
use crate::error::TaskForgeError;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Execute the `status` subcommand.
pub async fn execute(args: StatusArgs) -> Result<()> {
    let stream = tokio::time::timeout(
        Duration::from_secs(5),
        TcpStream::connect(&args.address),
    )
    .await
    .map_err(|_| TaskForgeError::config(format!("timed out connecting to {}", args.address)))??;

    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(b"status\n").await?;

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .map_err(|_| TaskForgeError::config("coordinator did not answer the status query"))??;

    let stats: serde_json::Value = serde_json::from_str(line.trim())
        .map_err(|e| TaskForgeError::config(format!("malformed status reply: {}", e)))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats).unwrap_or(line));
    } else {
        println!("{}", create_stats_table(&stats));
    }
    Ok(())
}
