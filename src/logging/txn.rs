//! Per-event transaction records.

use crate::Result;
use crate::core::resources::Resources;
use crate::core::task::Task;
use crate::error::TaskForgeError;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Direction tag for transfer records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Coordinator to worker (task input).
    Input,
    /// Worker to coordinator (task output).
    Output,
}

/// Why a worker left, recorded on its DISCONNECTED line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The coordinator released the worker (drain complete, shutdown).
    Released,
    /// The worker was a status client; closing is normal.
    StatusClient,
    /// The fast-abort policy removed the worker.
    FastAbort,
    /// The host was blocklisted while connected.
    Blocked,
    /// The keepalive timeout expired.
    IdleTimeout,
    /// The connection failed or the protocol was violated.
    Failure,
}

impl DisconnectReason {
    fn label(&self) -> &'static str {
        match self {
            DisconnectReason::Released => "RELEASED",
            DisconnectReason::StatusClient => "STATUS-CLIENT",
            DisconnectReason::FastAbort => "FAST-ABORT",
            DisconnectReason::Blocked => "BLOCKED",
            DisconnectReason::IdleTimeout => "IDLE-TIMEOUT",
            DisconnectReason::Failure => "FAILURE",
        }
    }
}

/// Append-only transaction log: one line per event of interest.
///
/// Record shape is `<timestamp-us> <SUBJECT> <id> <EVENT> [detail...]`, with
/// a short self-describing header at the top of the file.
#[derive(Debug)]
pub struct TransactionLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TransactionLog {
    /// Open (or create) the log and write the header comment.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| TaskForgeError::LogFile {
                path: path.to_path_buf(),
                source,
            })?;
        let mut log = TransactionLog {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        };
        log.write_raw("# time subject id event detail...");
        Ok(log)
    }

    /// Path the log was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_raw(&mut self, line: &str) {
        let _ = writeln!(self.writer, "{}", line);
        let _ = self.writer.flush();
    }

    fn write(&mut self, now_us: u64, record: &str) {
        self.write_raw(&format!("{} {}", now_us, record));
    }

    /// Coordinator lifecycle marks.
    pub fn coordinator(&mut self, now_us: u64, event: &str) {
        self.write(now_us, &format!("COORDINATOR {}", event));
    }

    /// A task changed state.
    pub fn task(&mut self, now_us: u64, task: &Task, event: &str) {
        self.write(
            now_us,
            &format!(
                "TASK {} {} {} {}",
                task.taskid,
                event,
                task.category,
                task.result.to_wire()
            ),
        );
    }

    /// A worker joined.
    pub fn worker_connected(&mut self, now_us: u64, hashkey: &str, addrport: &str) {
        self.write(now_us, &format!("WORKER {} CONNECTED {}", hashkey, addrport));
    }

    /// A worker left, with the reason.
    pub fn worker_disconnected(&mut self, now_us: u64, hashkey: &str, reason: DisconnectReason) {
        self.write(
            now_us,
            &format!("WORKER {} DISCONNECTED {}", hashkey, reason.label()),
        );
    }

    /// A worker reported its resources.
    pub fn worker_resources(&mut self, now_us: u64, hashkey: &str, resources: &Resources) {
        self.write(
            now_us,
            &format!(
                "WORKER {} RESOURCES {} {} {} {}",
                hashkey, resources.cores, resources.memory, resources.disk, resources.gpus
            ),
        );
    }

    /// A transfer completed.
    pub fn transfer(
        &mut self,
        now_us: u64,
        direction: TransferDirection,
        taskid: u64,
        fingerprint: &str,
        bytes: u64,
        elapsed_us: u64,
    ) {
        let dir = match direction {
            TransferDirection::Input => "INPUT",
            TransferDirection::Output => "OUTPUT",
        };
        self.write(
            now_us,
            &format!(
                "TRANSFER {} {} {} {} {}",
                dir, taskid, fingerprint, bytes, elapsed_us
            ),
        );
    }

    /// A category's first-allocation guess changed.
    pub fn category_first_allocation(&mut self, now_us: u64, name: &str, first: &Resources) {
        self.write(
            now_us,
            &format!(
                "CATEGORY {} FIRST-ALLOCATION {} {} {} {}",
                name, first.cores, first.memory, first.disk, first.gpus
            ),
        );
    }

    /// A ready task cannot fit any connected worker.
    pub fn large_task(&mut self, now_us: u64, taskid: u64, allocation: &Resources) {
        self.write(
            now_us,
            &format!(
                "TASK {} LARGER-THAN-ANY-WORKER {} {} {} {}",
                taskid, allocation.cores, allocation.memory, allocation.disk, allocation.gpus
            ),
        );
    }
}
