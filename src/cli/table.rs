//! Table formatting utilities for displaying structured CLI output.
//!
//! This module provides the table renderings used by the TaskForge CLI:
//! per-task result rows after a `run`, and coordinator statistics for
//! `status`. All tables use a consistent rounded border style with
//! left-aligned content.

use crate::core::Task;
use tabled::settings::{Alignment, Modify, Style, object::Rows};
use tabled::{Table, Tabled};

/// Display row for one finished task.
#[derive(Tabled)]
pub struct TaskDisplayRow {
    /// Task id.
    #[tabled(rename = "Task")]
    pub taskid: u64,
    /// Result classification.
    #[tabled(rename = "Result")]
    pub result: String,
    /// Process exit code.
    #[tabled(rename = "Exit")]
    pub exit_code: i64,
    /// Worker that ran the final attempt.
    #[tabled(rename = "Worker")]
    pub worker: String,
    /// Attempts used.
    #[tabled(rename = "Tries")]
    pub tries: u32,
    /// Command line.
    #[tabled(rename = "Command")]
    pub command: String,
}

impl TaskDisplayRow {
    /// Build a display row from a finished task.
    pub fn from_task(task: &Task) -> Self {
        TaskDisplayRow {
            taskid: task.taskid,
            result: format!("{:?}", task.result),
            exit_code: task.exit_code,
            worker: task.hostname.clone().unwrap_or_else(|| "-".to_string()),
            tries: task.try_count,
            command: task.command.clone(),
        }
    }
}

/// Render finished tasks as a rounded-border table.
pub fn create_task_table(rows: Vec<TaskDisplayRow>) -> String {
    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::new(..)).with(Alignment::left()));
    table.to_string()
}

/// Display row for one statistic in the `status` output.
#[derive(Tabled)]
pub struct StatDisplayRow {
    /// Counter name.
    #[tabled(rename = "Statistic")]
    pub name: String,
    /// Counter value.
    #[tabled(rename = "Value")]
    pub value: String,
}

/// Render a JSON stats dump as a two-column table.
pub fn create_stats_table(stats: &serde_json::Value) -> String {
    let mut rows = Vec::new();
    if let Some(map) = stats.as_object() {
        for (name, value) in map {
            rows.push(StatDisplayRow {
                name: name.clone(),
                value: value.to_string(),
            });
        }
    }
    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::new(..)).with(Alignment::left()));
    table.to_string()
}
