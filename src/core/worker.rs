//! Worker records: per-connection state kept by the coordinator.
//!
//! Every accepted connection starts as an [`WorkerType::Unknown`] record and
//! is upgraded once its first messages identify it as a worker (or a status
//! client). A worker record tracks the link, identity, advertised and
//! committed resources, feature set, cached-artifact index, and the set of
//! in-flight tasks with their allocation boxes. Cross-references to tasks are
//! ids, never pointers; on disconnect the coordinator resolves each id
//! against its own task table.

use super::link::Link;
use super::resources::Resources;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Classification of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerType {
    /// Connection has not yet identified itself.
    Unknown,
    /// Connection is a worker ready to execute tasks.
    Worker,
    /// Connection is a status client asking for statistics.
    Status,
}

/// What the coordinator knows about one entry in a worker's cache.
///
/// `size` and `mtime` mirror the last `cache-update` for the fingerprint (or
/// the local metadata observed when the coordinator itself sent the file);
/// a mismatch against current source metadata marks the entry stale.
#[derive(Debug, Clone, Copy)]
pub struct CachedArtifactInfo {
    /// Stored size in bytes.
    pub size: i64,
    /// Source modification time, seconds since epoch.
    pub mtime: i64,
    /// Time spent loading the entry, microseconds.
    pub transfer_time: u64,
}

/// Per-connected-worker state.
#[derive(Debug)]
pub struct Worker {
    /// Peer classification; dispatches go only to `Worker` records.
    pub worker_type: WorkerType,
    /// The TCP link to the worker.
    pub link: Link,

    /// Hostname reported in the greeting.
    pub hostname: String,
    /// Operating system reported in the greeting.
    pub os: String,
    /// Architecture reported in the greeting.
    pub arch: String,
    /// Worker software version reported in the greeting.
    pub version: String,
    /// Worker-chosen stable identity.
    pub workerid: String,
    /// Factory that started this worker, if any.
    pub factory_name: Option<String>,

    /// Remote address:port, for reporting and blocklisting.
    pub addrport: String,
    /// Locally unique key identifying this record.
    pub hashkey: String,

    /// Advertised resource totals.
    pub resources: Resources,
    /// Sum of allocations of in-flight tasks.
    pub committed: Resources,
    /// Features advertised by the worker.
    pub features: HashSet<String>,

    /// fingerprint -> cached artifact info.
    pub cache: HashMap<String, CachedArtifactInfo>,
    /// taskid -> allocation box for every in-flight task.
    pub current_tasks: HashMap<u64, Resources>,

    /// Worker receives no new dispatches and is released once idle.
    pub draining: bool,
    /// Raised on the first fast-abort kill; a second kill disconnects.
    pub fast_abort_alarm: bool,
    /// Worker's own termination deadline, microseconds since epoch.
    pub end_time_us: Option<u64>,

    /// When the connection was accepted, microseconds since epoch.
    pub start_time: u64,
    /// Last time any message arrived from this worker.
    pub last_msg_recv_time: u64,
    /// Last time a keepalive probe was sent (0 = none outstanding).
    pub last_probe_sent_time: u64,

    /// True once the version greeting was accepted.
    pub greeted: bool,
    /// Password challenge awaiting a reply, when authentication is on.
    pub auth_nonce: Option<String>,
    /// True once the password handshake completed (or none is required).
    pub authenticated: bool,

    /// Tasks completed on this worker.
    pub finished_tasks: u64,
    /// Total execution time of completed tasks, microseconds.
    pub total_task_time: u64,
    /// Total time spent transferring to/from this worker, microseconds.
    pub total_transfer_time: u64,
    /// Total file bytes moved to/from this worker.
    pub total_bytes_transferred: u64,
}

impl Worker {
    /// Wrap a freshly accepted link in an unidentified record.
    pub fn new(link: Link, now_us: u64) -> Self {
        let addrport = link.peer_addr();
        Worker {
            worker_type: WorkerType::Unknown,
            link,
            hostname: "unknown".to_string(),
            os: "unknown".to_string(),
            arch: "unknown".to_string(),
            version: "unknown".to_string(),
            workerid: String::new(),
            factory_name: None,
            addrport,
            hashkey: Uuid::new_v4().simple().to_string(),
            resources: Resources::unset(),
            committed: Resources::zero(),
            features: HashSet::new(),
            cache: HashMap::new(),
            current_tasks: HashMap::new(),
            draining: false,
            fast_abort_alarm: false,
            end_time_us: None,
            start_time: now_us,
            last_msg_recv_time: now_us,
            last_probe_sent_time: 0,
            greeted: false,
            auth_nonce: None,
            authenticated: false,
            finished_tasks: 0,
            total_task_time: 0,
            total_transfer_time: 0,
            total_bytes_transferred: 0,
        }
    }

    /// Host portion of the remote address.
    pub fn host(&self) -> &str {
        self.addrport.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.addrport)
    }

    /// True once the worker has reported its resources.
    pub fn has_reported_resources(&self) -> bool {
        !self.resources.is_unset()
    }

    /// Free resources after subtracting committed allocations.
    pub fn available(&self, multiplier: f64) -> Resources {
        self.resources.available(&self.committed, multiplier)
    }

    /// True if no in-flight task is assigned.
    pub fn is_idle(&self) -> bool {
        self.current_tasks.is_empty()
    }

    /// Record a dispatched task and commit its allocation.
    pub fn commit_task(&mut self, taskid: u64, allocation: Resources) {
        self.committed.accumulate(&allocation);
        self.current_tasks.insert(taskid, allocation);
    }

    /// Release a task's allocation box, returning it if present.
    pub fn release_task(&mut self, taskid: u64) -> Option<Resources> {
        let allocation = self.current_tasks.remove(&taskid)?;
        self.committed.release(&allocation);
        Some(allocation)
    }

    /// True if every required feature is advertised by this worker.
    pub fn has_features(&self, required: &[String]) -> bool {
        required.iter().all(|f| self.features.contains(f))
    }

    /// Total cached bytes among `fingerprints` present in the cache.
    pub fn cache_hit_bytes(&self, fingerprints: &[&str]) -> u64 {
        fingerprints
            .iter()
            .filter_map(|fp| self.cache.get(*fp))
            .map(|info| info.size.max(0) as u64)
            .sum()
    }

    /// Mean execution time of tasks completed on this worker, microseconds.
    pub fn mean_task_time(&self) -> Option<u64> {
        if self.finished_tasks == 0 {
            None
        } else {
            Some(self.total_task_time / self.finished_tasks)
        }
    }
}
