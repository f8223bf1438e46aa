//! Aggregate coordinator statistics.
//!
//! One [`CoordinatorStats`] instance accumulates for the life of the
//! coordinator. It feeds the performance log, catalog announcements, and the
//! JSON dump served to status clients, and is returned to the application by
//! `Coordinator::stats`.

use super::resources::Resources;
use serde::Serialize;

/// Counters describing the coordinator's current and cumulative state.
///
/// Instantaneous worker/task gauges are recomputed before every snapshot;
/// cumulative counters only ever grow. Times are microseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    // Current worker gauges.
    /// Workers currently connected.
    pub workers_connected: u64,
    /// Workers connected but without a resource report yet.
    pub workers_init: u64,
    /// Workers with no running task.
    pub workers_idle: u64,
    /// Workers running at least one task.
    pub workers_busy: u64,
    /// Workers able to fit the largest requested allocation.
    pub workers_able: u64,

    // Cumulative worker counters.
    /// Worker connections ever established.
    pub workers_joined: u64,
    /// Worker connections removed for any reason.
    pub workers_removed: u64,
    /// Workers the coordinator asked to disconnect.
    pub workers_released: u64,
    /// Workers disconnected by the fast-abort policy.
    pub workers_fast_aborted: u64,
    /// Workers refused or disconnected through the blocklist.
    pub workers_blocked: u64,
    /// Worker connections lost unexpectedly.
    pub workers_lost: u64,

    // Current task gauges.
    /// Tasks waiting in the ready queue.
    pub tasks_waiting: u64,
    /// Tasks dispatched and not yet retrieved.
    pub tasks_on_workers: u64,
    /// Tasks currently executing.
    pub tasks_running: u64,
    /// Tasks retrieved and waiting to be returned through `wait`.
    pub tasks_with_results: u64,

    // Cumulative task counters.
    /// Tasks ever submitted.
    pub tasks_submitted: u64,
    /// Dispatches performed (retries count again).
    pub tasks_dispatched: u64,
    /// Tasks returned through `wait`.
    pub tasks_done: u64,
    /// Tasks returned with a result other than success.
    pub tasks_failed: u64,
    /// Tasks cancelled.
    pub tasks_cancelled: u64,
    /// Attempts that ended in resource exhaustion.
    pub tasks_exhausted_attempts: u64,

    // Time accumulators, microseconds.
    /// When the coordinator started.
    pub time_when_started: u64,
    /// Total time spent sending task envelopes and inputs.
    pub time_send: u64,
    /// Total time spent receiving outputs.
    pub time_receive: u64,
    /// Total time spent exchanging status messages.
    pub time_status_msgs: u64,
    /// Total time blocked waiting for worker activity.
    pub time_polling: u64,
    /// Total time workers spent executing completed tasks.
    pub time_workers_execute: u64,

    // Transfer volume.
    /// File bytes sent to workers.
    pub bytes_sent: u64,
    /// File bytes received from workers.
    pub bytes_received: u64,

    // Aggregate resources across connected workers.
    /// Sum of advertised totals.
    pub total_resources: Resources,
    /// Sum of committed allocations.
    pub committed_resources: Resources,
}

impl CoordinatorStats {
    /// Observed mean transfer bandwidth in MB/s, if any bytes moved.
    pub fn bandwidth_mbps(&self) -> Option<f64> {
        let bytes = self.bytes_sent + self.bytes_received;
        let time = self.time_send + self.time_receive;
        if bytes == 0 || time == 0 {
            return None;
        }
        Some(bytes as f64 / time as f64)
    }
}
