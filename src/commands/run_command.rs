//! Implementation of the `run` subcommand.
//!
//! Starts an embedded coordinator, submits one task per command-line
//! argument, and waits until every task returns (or the overall timeout
//! expires). Results are printed as a table; the exit status reflects
//! whether all tasks succeeded.

use crate::Result;
use crate::cli::RunArgs;
use crate::cli::table::{TaskDisplayRow, create_task_table};
use crate::config::{CoordinatorConfig, SystemEnvironmentProvider};
use crate::core::{Coordinator, Task};
use colored::Colorize;
use log::info;

/// Execute the `run` subcommand.
pub async fn execute(args: RunArgs) -> Result<()> {
    let mut config = CoordinatorConfig::load(
        CoordinatorConfig::default_file_path().as_deref(),
        &SystemEnvironmentProvider::new(),
    )?;
    if let Some(port) = args.port {
        config.port.port = port;
    }
    if args.name.is_some() {
        config.name = args.name.clone();
    }
    if args.password_file.is_some() {
        config.security.password_file = args.password_file.clone();
    }
    config.logs.perf_log = args.perf_log.clone();
    config.logs.transaction_log = args.transaction_log.clone();

    let mut coordinator = Coordinator::create(config).await?;
    println!(
        "coordinator listening on port {}; waiting for workers",
        coordinator.port()
    );

    for command in &args.commands {
        let mut task = Task::new(command);
        task.specify_category(&args.category);
        if let Some(cores) = args.cores {
            task.specify_cores(cores);
        }
        if let Some(memory) = args.memory {
            task.specify_memory(memory);
        }
        if let Some(wall_time) = args.wall_time {
            task.specify_wall_time(wall_time);
        }
        let taskid = coordinator.submit(task)?;
        info!("submitted task {} for: {}", taskid, command);
    }

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(args.timeout);
    let mut finished = Vec::new();
    while !coordinator.empty() {
        if tokio::time::Instant::now() >= deadline {
            eprintln!("{}", "timeout waiting for tasks; cancelling the rest".red());
            for task in coordinator.cancel_all().await {
                finished.push(task);
            }
            break;
        }
        if let Some(task) = coordinator.wait(Some(5)).await? {
            let line = format!(
                "task {} finished: {:?} (exit {})",
                task.taskid, task.result, task.exit_code
            );
            if task.succeeded() {
                println!("{}", line.green());
            } else {
                println!("{}", line.red());
            }
            if let Some(output) = &task.output {
                if !output.is_empty() {
                    print!("{}", String::from_utf8_lossy(output));
                }
            }
            finished.push(task);
        }
    }

    let all_succeeded = finished.iter().all(|t| t.succeeded());
    let rows: Vec<TaskDisplayRow> = finished.iter().map(TaskDisplayRow::from_task).collect();
    println!("{}", create_task_table(rows));

    if all_succeeded {
        Ok(())
    } else {
        Err(crate::error::TaskForgeError::Other(anyhow::anyhow!(
            "one or more tasks failed"
        )))
    }
}
