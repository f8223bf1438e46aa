//! Periodic performance snapshots.

use crate::Result;
use crate::core::stats::CoordinatorStats;
use crate::error::TaskForgeError;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Column set written to every row, in order.
const COLUMNS: &[&str] = &[
    "timestamp",
    "workers_connected",
    "workers_init",
    "workers_idle",
    "workers_busy",
    "workers_joined",
    "workers_removed",
    "workers_lost",
    "tasks_waiting",
    "tasks_on_workers",
    "tasks_running",
    "tasks_with_results",
    "tasks_submitted",
    "tasks_dispatched",
    "tasks_done",
    "tasks_failed",
    "tasks_cancelled",
    "tasks_exhausted_attempts",
    "time_send",
    "time_receive",
    "time_polling",
    "bytes_sent",
    "bytes_received",
];

/// Append-only performance log with one counter row per flush interval.
#[derive(Debug)]
pub struct PerfLog {
    path: PathBuf,
    writer: BufWriter<File>,
    last_update_us: u64,
    interval_us: u64,
}

impl PerfLog {
    /// Open (or create) the log and write the column header.
    pub fn open(path: &Path, interval_us: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| TaskForgeError::LogFile {
                path: path.to_path_buf(),
                source,
            })?;
        let mut log = PerfLog {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            last_update_us: 0,
            interval_us,
        };
        log.write_header();
        Ok(log)
    }

    /// Path the log was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&mut self) {
        let mut header = String::from("#");
        for (i, column) in COLUMNS.iter().enumerate() {
            if i > 0 {
                header.push(' ');
            }
            header.push_str(column);
        }
        let _ = writeln!(self.writer, "{}", header);
        let _ = self.writer.flush();
    }

    /// Write a snapshot row if the interval elapsed (or `force` is set).
    pub fn write_update(&mut self, stats: &CoordinatorStats, now_us: u64, force: bool) {
        if !force && now_us.saturating_sub(self.last_update_us) < self.interval_us {
            return;
        }
        self.last_update_us = now_us;
        let row = [
            now_us,
            stats.workers_connected,
            stats.workers_init,
            stats.workers_idle,
            stats.workers_busy,
            stats.workers_joined,
            stats.workers_removed,
            stats.workers_lost,
            stats.tasks_waiting,
            stats.tasks_on_workers,
            stats.tasks_running,
            stats.tasks_with_results,
            stats.tasks_submitted,
            stats.tasks_dispatched,
            stats.tasks_done,
            stats.tasks_failed,
            stats.tasks_cancelled,
            stats.tasks_exhausted_attempts,
            stats.time_send,
            stats.time_receive,
            stats.time_polling,
            stats.bytes_sent,
            stats.bytes_received,
        ];
        let line = row
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(self.writer, "{}", line);
        let _ = self.writer.flush();
    }
}
