//! The coordinator: event loop, lifecycle manager, and dispatcher.
//!
//! A [`Coordinator`] is a single-threaded cooperative process core: one event
//! loop multiplexes the listening socket and every worker link, applies one
//! message handler at a time, runs the scheduler, and harvests completed
//! tasks into a queue consumed by [`Coordinator::wait`]. All state mutation
//! happens on the caller's task; there are no locks.
//!
//! Ownership follows an arena style: the coordinator owns task records by id
//! and worker records by hashkey. Workers and tasks reference each other by
//! id only, so a disconnect can never chase a dangling pointer.

mod get;
mod handlers;
mod put;

use super::artifact::ArtifactKind;
use super::category::{AllocationMode, AutolabelBits, Category};
use super::link::Link;
use super::protocol::url_encode;
use super::resources::Resources;
use super::scheduler::{Placement, SchedulePolicy, Scheduler};
use super::stats::CoordinatorStats;
use super::task::{AllocationBucket, ResultCode, Task, TaskState};
use super::timestamp_us;
use super::worker::{Worker, WorkerType};
use crate::Result;
use crate::config::CoordinatorConfig;
use crate::error::TaskForgeError;
use crate::logging::txn::{DisconnectReason, TransferDirection};
use crate::logging::{PerfLog, TransactionLog};
use crate::services::catalog::{CatalogAnnouncer, CatalogUpdate, UdpCatalogSink};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

/// Result of one pipeline operation, converted by the dispatcher into task
/// state updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferOutcome {
    /// The operation completed.
    Success,
    /// The worker link failed or the worker misbehaved; retry elsewhere.
    WorkerFailure,
    /// The application's data was at fault (missing input/output).
    AppFailure,
    /// The coordinator could not store data locally.
    LocalFailure,
}

/// Transfer tuning knobs derived from the configuration at create time.
#[derive(Debug, Clone)]
pub(crate) struct TransferTuning {
    /// Timeout for single-line control messages.
    pub short_timeout: Duration,
    /// Timeout for incomplete message continuations.
    pub long_timeout: Duration,
    /// Floor for any single transfer deadline.
    pub min_transfer_timeout: Duration,
    /// Multiple of the expected time after which a transfer is aborted.
    pub outlier_factor: u64,
    /// Assumed transfer rate, bytes per second.
    pub default_rate: u64,
    /// Bandwidth cap in bytes per second; zero disables pacing.
    pub bandwidth_limit: u64,
    /// Free-disk floor in bytes kept when storing outputs.
    pub disk_avail_threshold: u64,
}

impl TransferTuning {
    fn from_config(config: &CoordinatorConfig) -> Self {
        TransferTuning {
            short_timeout: Duration::from_secs(config.timeouts.short_secs),
            long_timeout: Duration::from_secs(config.timeouts.long_secs),
            min_transfer_timeout: Duration::from_secs(config.transfer.min_timeout_secs),
            outlier_factor: config.transfer.outlier_factor,
            default_rate: config.transfer.default_rate_bytes_per_sec,
            bandwidth_limit: config.transfer.bandwidth_limit_bytes_per_sec,
            disk_avail_threshold: config.transfer.disk_avail_threshold_mb * 1_000_000,
        }
    }

    /// Deadline for a transfer of `length` bytes: the expected time at the
    /// assumed rate, times the outlier factor, floored at the minimum.
    pub fn transfer_wait_time(&self, length: u64) -> Duration {
        let expected_secs = length / self.default_rate.max(1) + 1;
        let bounded = Duration::from_secs(expected_secs * self.outlier_factor);
        bounded.max(self.min_transfer_timeout)
    }

    /// Earliest completion time (microseconds since epoch) honoring the
    /// bandwidth limit, or `None` when no limit is set.
    pub fn bandwidth_stoptime(&self, length: u64) -> Option<u64> {
        if self.bandwidth_limit == 0 {
            return None;
        }
        let min_duration_us = length.saturating_mul(1_000_000) / self.bandwidth_limit;
        Some(timestamp_us() + min_duration_us)
    }
}

/// One blocklist entry; `until_us` of `None` blocks indefinitely.
#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    until_us: Option<u64>,
}

/// What the event loop observed while waiting.
enum Activity {
    /// A new connection arrived.
    Accepted(TcpStream),
    /// Some worker link became readable.
    Readable,
    /// Nothing happened within the poll timeout.
    TimedOut,
}

/// Poll timeout while messages are flowing.
const ACTIVE_POLL: Duration = Duration::from_millis(10);
/// Poll timeout after an idle iteration (`busy_waiting`).
const IDLE_POLL: Duration = Duration::from_millis(500);

/// The central process of a TaskForge application.
///
/// Create one with [`Coordinator::create`], submit [`Task`]s, and drive the
/// system by calling [`Coordinator::wait`] until it returns each finished
/// task. Dropping the coordinator closes every worker connection and
/// forfeits in-flight tasks; in-memory state is authoritative.
#[derive(Debug)]
pub struct Coordinator {
    config: CoordinatorConfig,
    tuning: TransferTuning,
    listener: TcpListener,
    port: u16,
    instance_id: String,
    password: Option<String>,

    tasks: HashMap<u64, Task>,
    ready: VecDeque<u64>,
    waiting_retrieval: VecDeque<u64>,
    retrieved: VecDeque<u64>,
    next_taskid: u64,

    workers: HashMap<String, Worker>,
    worker_of_task: HashMap<u64, String>,
    blocklist: HashMap<String, BlockEntry>,
    categories: HashMap<String, Category>,

    scheduler: Scheduler,
    stats: CoordinatorStats,
    perf_log: Option<PerfLog>,
    txn_log: Option<TransactionLog>,
    catalog: Option<CatalogAnnouncer>,

    busy_waiting: bool,
    time_last_large_task_check: u64,
    monitor_output_directory: Option<std::path::PathBuf>,
}

impl Coordinator {
    /// Create a coordinator: bind the listening port, read credentials, and
    /// open the configured logs.
    ///
    /// Failure to bind a port in the configured range, to read a configured
    /// password file, or to open a configured log file is fatal here.
    pub async fn create(config: CoordinatorConfig) -> Result<Self> {
        crate::config::validator::validate(&config)?;

        let (listener, port) = Self::bind_listener(&config).await?;
        info!("coordinator listening on port {}", port);

        let password = match &config.security.password_file {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .map_err(|source| TaskForgeError::PasswordFile {
                        path: path.clone(),
                        source,
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };

        let perf_log = match &config.logs.perf_log {
            Some(path) => Some(PerfLog::open(path, config.logs.perf_interval_secs * 1_000_000)?),
            None => None,
        };
        let mut txn_log = match &config.logs.transaction_log {
            Some(path) => Some(TransactionLog::open(path)?),
            None => None,
        };
        if let Some(txn) = &mut txn_log {
            txn.coordinator(timestamp_us(), "START");
        }

        let catalog = match (&config.name, config.catalog.hosts.is_empty()) {
            (Some(_), false) => Some(CatalogAnnouncer::new(
                Box::new(UdpCatalogSink::new(config.catalog.hosts.clone())),
                config.catalog.interval_secs * 1_000_000,
            )),
            _ => None,
        };

        let scheduler = Scheduler::new(
            config.scheduling.policy,
            config.scheduling.submit_multiplier,
        );

        let mut stats = CoordinatorStats::default();
        stats.time_when_started = timestamp_us();

        let tuning = TransferTuning::from_config(&config);
        Ok(Coordinator {
            config,
            tuning,
            listener,
            port,
            instance_id: Uuid::new_v4().simple().to_string(),
            password,
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            waiting_retrieval: VecDeque::new(),
            retrieved: VecDeque::new(),
            next_taskid: 1,
            workers: HashMap::new(),
            worker_of_task: HashMap::new(),
            blocklist: HashMap::new(),
            categories: HashMap::new(),
            scheduler,
            stats,
            perf_log,
            txn_log,
            catalog,
            busy_waiting: false,
            time_last_large_task_check: 0,
            monitor_output_directory: None,
        })
    }

    async fn bind_listener(config: &CoordinatorConfig) -> Result<(TcpListener, u16)> {
        if config.port.port != 0 {
            let listener = TcpListener::bind(("0.0.0.0", config.port.port)).await?;
            return Ok((listener, config.port.port));
        }
        for port in config.port.low_port..=config.port.high_port {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => return Ok((listener, port)),
                Err(_) => continue,
            }
        }
        Err(TaskForgeError::PortRangeExhausted {
            low: config.port.low_port,
            high: config.port.high_port,
        })
    }

    /// The bound listening port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Project name announced to the catalog, if configured.
    pub fn project_name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    /// True once every submitted task has been returned or cancelled.
    pub fn empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Refresh and return a snapshot of the aggregate statistics.
    pub fn stats(&mut self) -> CoordinatorStats {
        self.refresh_gauges();
        self.stats.clone()
    }

    /// How many additional tasks the coordinator could efficiently absorb.
    ///
    /// Zero means the queue is saturated relative to the connected capacity
    /// and the configured minimum.
    pub fn hungry(&self) -> u64 {
        let backlog = (self.ready.len() + self.worker_of_task.len()) as u64;
        let slots: u64 = self
            .workers
            .values()
            .filter(|w| w.worker_type == WorkerType::Worker)
            .map(|w| {
                w.available(self.config.scheduling.submit_multiplier)
                    .cores
                    .max(0) as u64
            })
            .sum();
        let target = self.config.scheduling.hungry_minimum.max(2 * slots);
        target.saturating_sub(backlog)
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    /// Submit a task for execution, returning its assigned id.
    ///
    /// The task object may be one returned earlier by `wait`; transient
    /// per-attempt state is cleared on entry.
    pub fn submit(&mut self, mut task: Task) -> Result<u64> {
        if !task.is_submittable() {
            return Err(TaskForgeError::specification(
                "task has neither a command nor a coprocess",
            ));
        }
        task.clean(true);

        let taskid = self.next_taskid;
        self.next_taskid += 1;
        task.taskid = taskid;
        task.time_when_submitted = timestamp_us();
        task.state = TaskState::Ready;

        if let Some(directory) = &self.monitor_output_directory {
            if task.monitor_output_directory.is_none() {
                task.specify_monitor_output(&directory.to_string_lossy())?;
            }
        }

        // The monitor summary destination embeds the taskid, which is only
        // known now.
        if let (Some(dir), Some(remote)) = (
            task.monitor_output_directory.clone(),
            task.monitor_summary_remote.clone(),
        ) {
            for output in &mut task.outputs {
                if output.remote_name == remote {
                    output.source = dir
                        .join(format!("task-{}.summary", taskid))
                        .to_string_lossy()
                        .into_owned();
                }
            }
        }

        let category = self
            .categories
            .entry(task.category.clone())
            .or_insert_with(|| Category::new(&task.category));
        category.tasks_submitted += 1;

        self.stats.tasks_submitted += 1;
        if let Some(txn) = &mut self.txn_log {
            txn.task(timestamp_us(), &task, "SUBMITTED");
        }
        debug!("submitted task {}: {}", taskid, task.command);

        self.tasks.insert(taskid, task);
        self.enqueue_ready(taskid, false);
        Ok(taskid)
    }

    /// Raise the floor for future task ids.
    pub fn set_taskid_min(&mut self, min: u64) {
        self.next_taskid = self.next_taskid.max(min);
    }

    /// Wait up to `timeout_secs` for a task to finish (forever when `None`).
    ///
    /// While blocked the event loop runs: connections are accepted, messages
    /// handled, tasks dispatched and retrieved. A timeout of zero returns the
    /// first already-retrieved task without blocking, or `None`.
    pub async fn wait(&mut self, timeout_secs: Option<u64>) -> Result<Option<Task>> {
        self.wait_internal(timeout_secs, None).await
    }

    /// Like [`Coordinator::wait`], returning only tasks carrying `tag`.
    pub async fn wait_for_tag(
        &mut self,
        timeout_secs: Option<u64>,
        tag: &str,
    ) -> Result<Option<Task>> {
        self.wait_internal(timeout_secs, Some(tag)).await
    }

    async fn wait_internal(
        &mut self,
        timeout_secs: Option<u64>,
        tag: Option<&str>,
    ) -> Result<Option<Task>> {
        let deadline =
            timeout_secs.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
        loop {
            if let Some(task) = self.pop_retrieved(tag) {
                return Ok(Some(task));
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Ok(None);
                }
            }
            self.tick().await?;
        }
    }

    fn pop_retrieved(&mut self, tag: Option<&str>) -> Option<Task> {
        let position = self.retrieved.iter().position(|id| match tag {
            None => true,
            Some(tag) => self
                .tasks
                .get(id)
                .map(|t| t.tag.as_deref() == Some(tag))
                .unwrap_or(false),
        })?;
        let taskid = self.retrieved.remove(position)?;
        let mut task = self.tasks.remove(&taskid)?;
        task.state = TaskState::Done;
        task.time_when_done = timestamp_us();

        self.stats.tasks_done += 1;
        if task.result != ResultCode::Success {
            self.stats.tasks_failed += 1;
        }
        if let Some(category) = self.categories.get_mut(&task.category) {
            category.tasks_done += 1;
            if task.result != ResultCode::Success {
                category.tasks_failed += 1;
            }
        }
        if let Some(txn) = &mut self.txn_log {
            txn.task(task.time_when_done, &task, "DONE");
        }
        Some(task)
    }

    /// Cancel a task wherever it currently is.
    ///
    /// Ready tasks leave the queue; in-flight tasks get a best-effort `kill`
    /// at their worker and are considered canceled locally regardless of the
    /// worker's reaction. Returns the task descriptor, or `None` for an
    /// unknown id.
    pub async fn cancel_by_taskid(&mut self, taskid: u64) -> Option<Task> {
        if !self.tasks.contains_key(&taskid) {
            return None;
        }
        self.detach_task(taskid).await;
        let mut task = self.tasks.remove(&taskid)?;
        task.state = TaskState::Canceled;
        self.stats.tasks_cancelled += 1;
        if let Some(txn) = &mut self.txn_log {
            txn.task(timestamp_us(), &task, "CANCELED");
        }
        Some(task)
    }

    /// Cancel the first task carrying `tag`.
    pub async fn cancel_by_tag(&mut self, tag: &str) -> Option<Task> {
        let taskid = self
            .tasks
            .values()
            .find(|t| t.tag.as_deref() == Some(tag))
            .map(|t| t.taskid)?;
        self.cancel_by_taskid(taskid).await
    }

    /// Cancel every known task, returning the descriptors.
    pub async fn cancel_all(&mut self) -> Vec<Task> {
        let ids: Vec<u64> = self.tasks.keys().copied().collect();
        let mut canceled = Vec::with_capacity(ids.len());
        for taskid in ids {
            if let Some(task) = self.cancel_by_taskid(taskid).await {
                canceled.push(task);
            }
        }
        canceled
    }

    /// Remove a task from whichever structure holds it, killing it at its
    /// worker if in flight.
    async fn detach_task(&mut self, taskid: u64) {
        self.ready.retain(|id| *id != taskid);
        self.waiting_retrieval.retain(|id| *id != taskid);
        self.retrieved.retain(|id| *id != taskid);
        if let Some(hashkey) = self.worker_of_task.remove(&taskid) {
            if let Some(worker) = self.workers.get_mut(&hashkey) {
                let short = self.tuning.short_timeout;
                let _ = worker
                    .link
                    .send_line(&format!("kill {}", taskid), short)
                    .await;
                worker.release_task(taskid);
            }
        }
    }

    // ------------------------------------------------------------------
    // Worker administration
    // ------------------------------------------------------------------

    /// Block a host indefinitely. A connected worker from that host is
    /// disconnected; future connections are refused.
    pub async fn block_host(&mut self, host: &str) {
        self.block_host_internal(host, None).await;
    }

    /// Block a host for `seconds`, then admit it again.
    pub async fn block_host_with_timeout(&mut self, host: &str, seconds: u64) {
        let until = timestamp_us() + seconds * 1_000_000;
        self.block_host_internal(host, Some(until)).await;
    }

    async fn block_host_internal(&mut self, host: &str, until_us: Option<u64>) {
        self.blocklist
            .insert(host.to_string(), BlockEntry { until_us });
        self.stats.workers_blocked += 1;
        let victims: Vec<String> = self
            .workers
            .values()
            .filter(|w| w.host() == host)
            .map(|w| w.hashkey.clone())
            .collect();
        for hashkey in victims {
            self.remove_worker(&hashkey, DisconnectReason::Blocked).await;
        }
    }

    /// Remove a host from the blocklist.
    pub fn unblock_host(&mut self, host: &str) {
        self.blocklist.remove(host);
    }

    /// Mark every worker on `hostname` as draining (or not). Draining
    /// workers receive no new dispatches and are released once idle.
    pub fn specify_draining(&mut self, hostname: &str, draining: bool) {
        for worker in self.workers.values_mut() {
            if worker.hostname == hostname {
                worker.draining = draining;
            }
        }
    }

    /// Drop `fingerprint` from every worker cache; running tasks that use it
    /// are killed and resubmitted.
    pub async fn invalidate_fingerprint(&mut self, fingerprint: &str) {
        let short = self.tuning.short_timeout;
        let keys: Vec<String> = self.workers.keys().cloned().collect();
        for key in keys {
            if let Some(worker) = self.workers.get_mut(&key) {
                if worker.cache.remove(fingerprint).is_some() {
                    let _ = worker
                        .link
                        .send_line(&format!("invalidate {}", url_encode(fingerprint)), short)
                        .await;
                }
            }
        }
        let affected: Vec<u64> = self
            .tasks
            .values()
            .filter(|t| {
                matches!(t.state, TaskState::Running | TaskState::WaitingRetrieval)
                    && t.inputs.iter().any(|a| a.fingerprint == fingerprint)
            })
            .map(|t| t.taskid)
            .collect();
        for taskid in affected {
            self.abort_and_requeue(taskid).await;
        }
    }

    // ------------------------------------------------------------------
    // Category controls
    // ------------------------------------------------------------------

    fn category_mut(&mut self, name: &str) -> &mut Category {
        self.categories
            .entry(name.to_string())
            .or_insert_with(|| Category::new(name))
    }

    /// Set the allocation mode of a category.
    pub fn set_category_mode(&mut self, name: &str, mode: AllocationMode) {
        self.category_mut(name).mode = mode;
    }

    /// Enable or disable autolabeling per resource for a category.
    pub fn enable_category_autolabel(&mut self, name: &str, bits: AutolabelBits) {
        self.category_mut(name).autolabel = bits;
    }

    /// Set a category's hard per-task maximum bounds.
    pub fn set_category_max_resources(&mut self, name: &str, max: Resources) {
        self.category_mut(name).max_allocation = max;
    }

    /// Set a category's per-task minimum bounds.
    pub fn set_category_min_resources(&mut self, name: &str, min: Resources) {
        self.category_mut(name).min_allocation = min;
    }

    /// Seed a category's first-allocation guess.
    pub fn set_category_first_allocation(&mut self, name: &str, first: Resources) {
        self.category_mut(name).first_allocation = first;
    }

    /// Activate fast-abort globally with the given multiplier (zero
    /// disables).
    pub fn activate_fast_abort(&mut self, multiplier: f64) {
        self.config.scheduling.fast_abort_multiplier = multiplier;
    }

    /// Override the fast-abort multiplier for one category.
    pub fn activate_fast_abort_category(&mut self, name: &str, multiplier: f64) {
        self.category_mut(name).fast_abort_multiplier = Some(multiplier);
    }

    /// Change the global scheduling policy.
    pub fn specify_policy(&mut self, policy: SchedulePolicy) {
        self.scheduler.policy = policy;
    }

    /// Collect resource-monitor summaries for every task into `directory`.
    ///
    /// Tasks submitted afterwards declare a monitor summary output (fetched
    /// at minimum whenever the task fails) unless they already carry one.
    pub fn enable_monitoring(&mut self, directory: &Path) -> Result<()> {
        std::fs::create_dir_all(directory)?;
        self.monitor_output_directory = Some(directory.to_path_buf());
        Ok(())
    }

    /// Open a performance log after creation.
    pub fn enable_perf_log(&mut self, path: &Path) -> Result<()> {
        self.perf_log = Some(PerfLog::open(
            path,
            self.config.logs.perf_interval_secs * 1_000_000,
        )?);
        Ok(())
    }

    /// Open a transaction log after creation.
    pub fn enable_transaction_log(&mut self, path: &Path) -> Result<()> {
        let mut log = TransactionLog::open(path)?;
        log.coordinator(timestamp_us(), "START");
        self.txn_log = Some(log);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// One iteration of the event loop.
    async fn tick(&mut self) -> Result<()> {
        let poll_timeout = if self.busy_waiting { IDLE_POLL } else { ACTIVE_POLL };

        let poll_started = timestamp_us();
        let activity = self.wait_for_activity(poll_timeout).await;
        self.stats.time_polling += timestamp_us().saturating_sub(poll_started);

        let mut work = 0usize;
        if let Activity::Accepted(stream) = activity {
            self.register_connection(stream);
            work += 1;
        }
        work += self.accept_pending();
        work += self.poll_workers().await;
        self.handle_timers().await;
        work += self.retrieve_completed().await;
        work += self.dispatch_ready_tasks().await;

        self.busy_waiting = work == 0;
        Ok(())
    }

    /// Block until the listener or any worker link shows activity, bounded
    /// by `timeout`. Buffered lines count as immediate activity.
    async fn wait_for_activity(&self, timeout: Duration) -> Activity {
        use futures::future::{BoxFuture, select_all};

        if self.workers.values().any(|w| w.link.has_buffered()) {
            return Activity::Readable;
        }

        let mut futures: Vec<BoxFuture<'_, Activity>> = Vec::with_capacity(self.workers.len() + 1);
        futures.push(Box::pin(async {
            match self.listener.accept().await {
                Ok((stream, _)) => Activity::Accepted(stream),
                Err(_) => Activity::TimedOut,
            }
        }));
        for worker in self.workers.values() {
            futures.push(Box::pin(async move {
                let _ = worker.link.readable().await;
                Activity::Readable
            }));
        }

        match tokio::time::timeout(timeout, select_all(futures)).await {
            Ok((activity, _, _)) => activity,
            Err(_) => Activity::TimedOut,
        }
    }

    /// Accept any further pending connections without blocking, bounded per
    /// iteration so existing workers are not starved.
    fn accept_pending(&mut self) -> usize {
        use futures::FutureExt;
        let mut accepted = 0;
        while (accepted as u64) < self.config.scheduling.max_new_workers_per_cycle {
            let pending = self.listener.accept().now_or_never();
            match pending {
                Some(Ok((stream, _))) => {
                    self.register_connection(stream);
                    accepted += 1;
                }
                _ => break,
            }
        }
        accepted
    }

    /// Active (non-expired) blocklist hosts.
    fn active_blocked_hosts(&self) -> HashSet<String> {
        let now = timestamp_us();
        self.blocklist
            .iter()
            .filter(|(_, entry)| entry.until_us.map(|until| until > now).unwrap_or(true))
            .map(|(host, _)| host.clone())
            .collect()
    }

    fn register_connection(&mut self, stream: TcpStream) {
        let link = Link::new(stream);
        let worker = Worker::new(link, timestamp_us());
        if self.active_blocked_hosts().contains(worker.host()) {
            info!("refusing connection from blocked host {}", worker.host());
            self.stats.workers_blocked += 1;
            return;
        }
        debug!("new connection from {}", worker.addrport);
        self.stats.workers_joined += 1;
        if let Some(txn) = &mut self.txn_log {
            txn.worker_connected(timestamp_us(), &worker.hashkey, &worker.addrport);
        }
        self.workers.insert(worker.hashkey.clone(), worker);
    }

    /// Drain buffered messages from every worker link.
    async fn poll_workers(&mut self) -> usize {
        let mut handled = 0;
        let keys: Vec<String> = self.workers.keys().cloned().collect();
        for key in keys {
            let fill = match self.workers.get_mut(&key) {
                Some(worker) => worker.link.try_fill(),
                None => continue,
            };
            if fill.is_err() {
                let reason = match self.workers.get(&key).map(|w| w.worker_type) {
                    Some(WorkerType::Status) => DisconnectReason::StatusClient,
                    _ => DisconnectReason::Failure,
                };
                self.remove_worker(&key, reason).await;
                continue;
            }
            loop {
                let line = match self.workers.get_mut(&key) {
                    Some(worker) => worker.link.pop_line(),
                    None => break,
                };
                let Some(line) = line else {
                    // A line that grows past the protocol maximum without a
                    // terminator is a framing violation.
                    if self
                        .workers
                        .get(&key)
                        .map(|w| w.link.buffered_len() > super::protocol::LINE_MAX)
                        .unwrap_or(false)
                    {
                        self.remove_worker(&key, DisconnectReason::Failure).await;
                    }
                    break;
                };
                handled += 1;
                if let Some(worker) = self.workers.get_mut(&key) {
                    worker.last_msg_recv_time = timestamp_us();
                }
                match handlers::handle_message(self, &key, &line).await {
                    handlers::MessageAction::Continue => {}
                    handlers::MessageAction::Disconnect(reason) => {
                        self.remove_worker(&key, reason).await;
                        break;
                    }
                }
            }
        }
        handled
    }

    /// Remove a worker record and resolve each of its in-flight tasks.
    async fn remove_worker(&mut self, hashkey: &str, reason: DisconnectReason) {
        let Some(mut worker) = self.workers.remove(hashkey) else {
            return;
        };
        if reason == DisconnectReason::Released {
            let _ = worker.link.send_line("release", self.tuning.short_timeout).await;
        }
        if worker.worker_type != WorkerType::Status {
            info!(
                "worker {} ({}) removed: {:?}",
                worker.hostname, worker.addrport, reason
            );
        }
        self.stats.workers_removed += 1;
        match reason {
            DisconnectReason::Failure | DisconnectReason::IdleTimeout => {
                self.stats.workers_lost += 1
            }
            DisconnectReason::FastAbort => self.stats.workers_fast_aborted += 1,
            DisconnectReason::Released => self.stats.workers_released += 1,
            _ => {}
        }
        if let Some(txn) = &mut self.txn_log {
            txn.worker_disconnected(timestamp_us(), hashkey, reason);
        }

        let lost_tasks: Vec<u64> = worker.current_tasks.keys().copied().collect();
        for taskid in lost_tasks {
            self.resolve_lost_task(taskid);
        }
    }

    /// A task's worker is gone: retry it if attempts remain, otherwise
    /// surface the failure.
    fn resolve_lost_task(&mut self, taskid: u64) {
        self.worker_of_task.remove(&taskid);
        self.waiting_retrieval.retain(|id| *id != taskid);
        let Some(task) = self.tasks.get_mut(&taskid) else {
            return;
        };
        if task.max_retries > 0 && task.try_count >= task.max_retries {
            task.update_result(ResultCode::MaxRetries);
            task.state = TaskState::Retrieved;
            task.time_when_retrieval = timestamp_us();
            self.retrieved.push_back(taskid);
            return;
        }
        debug!("task {} lost its worker; returning to ready queue", taskid);
        task.clean(false);
        self.enqueue_ready(taskid, true);
    }

    /// Insert a task into the priority-ordered ready queue.
    ///
    /// Retried tasks (`front`) go ahead of equal-priority peers; fresh
    /// submissions go behind them.
    fn enqueue_ready(&mut self, taskid: u64, front: bool) {
        let priority = self
            .tasks
            .get(&taskid)
            .map(|t| t.priority)
            .unwrap_or_default();
        let position = if front {
            self.ready.iter().position(|id| {
                self.tasks
                    .get(id)
                    .map(|t| t.priority <= priority)
                    .unwrap_or(true)
            })
        } else {
            self.ready.iter().position(|id| {
                self.tasks
                    .get(id)
                    .map(|t| t.priority < priority)
                    .unwrap_or(true)
            })
        };
        match position {
            Some(position) => self.ready.insert(position, taskid),
            None => self.ready.push_back(taskid),
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Run the scheduler until no further (task, worker) pairing exists.
    async fn dispatch_ready_tasks(&mut self) -> usize {
        let mut dispatched = 0;
        loop {
            let blocked = self.active_blocked_hosts();
            let placement = self.scheduler.select(
                &self.ready,
                &self.tasks,
                &self.workers,
                &self.categories,
                &blocked,
                timestamp_us(),
            );
            let Some(placement) = placement else { break };
            self.commit_placement(placement).await;
            dispatched += 1;
        }
        dispatched
    }

    /// Send the envelope and inputs for one placement, then account for it.
    async fn commit_placement(&mut self, placement: Placement) {
        let Placement {
            taskid,
            hashkey,
            allocation,
        } = placement;
        self.ready.retain(|id| *id != taskid);
        let Some(mut task) = self.tasks.remove(&taskid) else {
            return;
        };
        let tuning = self.tuning.clone();

        let Some(worker) = self.workers.get_mut(&hashkey) else {
            self.tasks.insert(taskid, task);
            self.enqueue_ready(taskid, true);
            return;
        };

        task.resources_allocated = allocation;
        task.time_when_commit_start = timestamp_us();
        let (outcome, records) = put::put_task_on_worker(&tuning, worker, &mut task).await;
        task.time_when_commit_end = timestamp_us();
        self.stats.time_send += task
            .time_when_commit_end
            .saturating_sub(task.time_when_commit_start);
        for record in &records {
            self.stats.bytes_sent += record.bytes;
            if let Some(txn) = &mut self.txn_log {
                txn.transfer(
                    timestamp_us(),
                    TransferDirection::Input,
                    taskid,
                    &record.fingerprint,
                    record.bytes,
                    record.elapsed_us,
                );
            }
        }

        match outcome {
            TransferOutcome::Success => {
                let Some(worker) = self.workers.get_mut(&hashkey) else {
                    self.tasks.insert(taskid, task);
                    self.enqueue_ready(taskid, true);
                    return;
                };
                task.state = TaskState::Running;
                task.try_count += 1;
                task.worker_hashkey = Some(hashkey.clone());
                task.hostname = Some(worker.hostname.clone());
                task.addrport = Some(worker.addrport.clone());
                worker.commit_task(taskid, allocation);
                self.worker_of_task.insert(taskid, hashkey.clone());
                self.stats.tasks_dispatched += 1;
                if let Some(txn) = &mut self.txn_log {
                    txn.task(timestamp_us(), &task, "DISPATCHED");
                }
                debug!("task {} dispatched to {}", taskid, hashkey);
                self.tasks.insert(taskid, task);
            }
            TransferOutcome::WorkerFailure => {
                self.tasks.insert(taskid, task);
                self.enqueue_ready(taskid, true);
                self.remove_worker(&hashkey, DisconnectReason::Failure).await;
            }
            TransferOutcome::AppFailure | TransferOutcome::LocalFailure => {
                // Input missing: the diagnosis is already on the task.
                task.state = TaskState::Retrieved;
                task.time_when_retrieval = timestamp_us();
                if let Some(txn) = &mut self.txn_log {
                    txn.task(task.time_when_retrieval, &task, "RETRIEVED");
                }
                self.tasks.insert(taskid, task);
                self.retrieved.push_back(taskid);
            }
        }
    }

    // ------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------

    /// Fetch outputs of tasks whose workers reported completion.
    async fn retrieve_completed(&mut self) -> usize {
        let mut retrieved = 0;
        while let Some(taskid) = self.waiting_retrieval.pop_front() {
            if self.fetch_task_outputs(taskid).await {
                retrieved += 1;
            }
            if !self.config.scheduling.wait_retrieve_many {
                break;
            }
        }
        retrieved
    }

    async fn fetch_task_outputs(&mut self, taskid: u64) -> bool {
        let tuning = self.tuning.clone();
        let Some(hashkey) = self.worker_of_task.get(&taskid).cloned() else {
            return false;
        };
        let Some(mut task) = self.tasks.remove(&taskid) else {
            return false;
        };
        if self.workers.get(&hashkey).is_none() {
            self.tasks.insert(taskid, task);
            self.resolve_lost_task(taskid);
            return true;
        }

        let succeeded = task.succeeded();
        let fetch_list: Vec<crate::core::artifact::Artifact> = task
            .outputs
            .iter()
            .filter(|a| matches!(a.kind, ArtifactKind::File))
            .filter(|a| {
                if a.flags.failure_only && succeeded {
                    return false;
                }
                if a.flags.success_only && !succeeded {
                    return false;
                }
                true
            })
            .cloned()
            .collect();

        let retrieval_started = timestamp_us();
        let mut worker_failed = false;
        let mut transfer_records = Vec::new();
        if let Some(worker) = self.workers.get_mut(&hashkey) {
            for artifact in &fetch_list {
                let transfer_started = timestamp_us();
                let (outcome, bytes) =
                    get::get_output_file(&tuning, worker, &mut task, artifact).await;
                let elapsed = timestamp_us().saturating_sub(transfer_started);
                if bytes > 0 {
                    task.bytes_received += bytes;
                    task.bytes_transferred += bytes;
                    worker.total_bytes_transferred += bytes;
                    worker.total_transfer_time += elapsed;
                    transfer_records.push((artifact.fingerprint.clone(), bytes, elapsed));
                }
                match outcome {
                    TransferOutcome::Success => {}
                    TransferOutcome::WorkerFailure => {
                        worker_failed = true;
                        break;
                    }
                    // Local storage failures are already recorded on the
                    // task; keep fetching so partial results arrive.
                    TransferOutcome::LocalFailure | TransferOutcome::AppFailure => {}
                }
            }
        }
        self.stats.time_receive += timestamp_us().saturating_sub(retrieval_started);
        for (fingerprint, bytes, elapsed) in &transfer_records {
            self.stats.bytes_received += bytes;
            if let Some(txn) = &mut self.txn_log {
                txn.transfer(
                    timestamp_us(),
                    TransferDirection::Output,
                    taskid,
                    fingerprint,
                    *bytes,
                    *elapsed,
                );
            }
        }

        if worker_failed {
            self.tasks.insert(taskid, task);
            self.remove_worker(&hashkey, DisconnectReason::Failure).await;
            return true;
        }

        if let Some(worker) = self.workers.get_mut(&hashkey) {
            let _ = worker
                .link
                .send_line(&format!("kill {}", taskid), tuning.short_timeout)
                .await;
            worker.release_task(taskid);
            worker.finished_tasks += 1;
            worker.total_task_time += task.time_workers_execute_last;
            worker.fast_abort_alarm = false;
        }
        self.worker_of_task.remove(&taskid);
        self.stats.time_workers_execute += task.time_workers_execute_last;

        let first_allocation_changed = {
            let category = self
                .categories
                .entry(task.category.clone())
                .or_insert_with(|| Category::new(&task.category));
            category
                .accumulate_measurement(task.resources_measured, task.time_workers_execute_last)
        };
        if first_allocation_changed {
            let first = self.categories[&task.category].first_allocation;
            if let Some(txn) = &mut self.txn_log {
                txn.category_first_allocation(timestamp_us(), &task.category, &first);
            }
        }

        // Resource exhaustion on a FIRST allocation widens and retries; at
        // MAX (or in fixed mode) the failure is permanent.
        if task.result == ResultCode::ResourceExhaustion {
            task.exhausted_attempts += 1;
            self.stats.tasks_exhausted_attempts += 1;
            let mode = self.categories[&task.category].mode;
            if let Some(category) = self.categories.get_mut(&task.category) {
                category.tasks_exhausted_attempts += 1;
            }
            if task.resource_request == AllocationBucket::First && mode != AllocationMode::Fixed {
                task.resource_request = AllocationBucket::Max;
                task.clean(false);
                self.tasks.insert(taskid, task);
                self.enqueue_ready(taskid, true);
                return true;
            }
        }

        task.state = TaskState::Retrieved;
        task.time_when_retrieval = timestamp_us();
        if let Some(txn) = &mut self.txn_log {
            txn.task(task.time_when_retrieval, &task, "RETRIEVED");
        }
        self.tasks.insert(taskid, task);
        self.retrieved.push_back(taskid);
        true
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    async fn handle_timers(&mut self) {
        let now = timestamp_us();
        self.expire_blocklist(now);
        self.check_keepalives(now).await;
        self.check_fast_abort(now).await;
        self.release_drained_workers().await;
        self.check_large_tasks(now);
        self.announce_catalog(now).await;
        self.flush_perf_log(now);
    }

    fn expire_blocklist(&mut self, now: u64) {
        self.blocklist
            .retain(|_, entry| entry.until_us.map(|until| until > now).unwrap_or(true));
    }

    async fn check_keepalives(&mut self, now: u64) {
        let interval = self.config.timeouts.keepalive_interval_secs * 1_000_000;
        let timeout = self.config.timeouts.keepalive_timeout_secs * 1_000_000;
        let short = self.tuning.short_timeout;

        let mut dead = Vec::new();
        let mut probes = Vec::new();
        for worker in self.workers.values() {
            if worker.worker_type != WorkerType::Worker {
                continue;
            }
            let idle = now.saturating_sub(worker.last_msg_recv_time);
            if idle > timeout {
                dead.push(worker.hashkey.clone());
            } else if idle > interval && worker.last_probe_sent_time < worker.last_msg_recv_time {
                probes.push(worker.hashkey.clone());
            }
        }
        for hashkey in dead {
            warn!("worker {} timed out without a keepalive reply", hashkey);
            self.remove_worker(&hashkey, DisconnectReason::IdleTimeout)
                .await;
        }
        for hashkey in probes {
            let sent = match self.workers.get_mut(&hashkey) {
                Some(worker) => match worker.link.send_line("check", short).await {
                    Ok(()) => {
                        worker.last_probe_sent_time = now;
                        true
                    }
                    Err(_) => false,
                },
                None => true,
            };
            if !sent {
                self.remove_worker(&hashkey, DisconnectReason::Failure).await;
            }
        }
    }

    /// Kill in-flight tasks running far beyond their category's mean.
    async fn check_fast_abort(&mut self, now: u64) {
        let default_multiplier = self.config.scheduling.fast_abort_multiplier;
        let mut victims = Vec::new();
        for task in self.tasks.values() {
            if task.state != TaskState::Running {
                continue;
            }
            let Some(category) = self.categories.get(&task.category) else {
                continue;
            };
            let Some(limit) = category.fast_abort_limit(default_multiplier) else {
                continue;
            };
            let runtime = now.saturating_sub(task.time_when_commit_end);
            if runtime > limit {
                victims.push(task.taskid);
            }
        }
        for taskid in victims {
            warn!("fast-abort: task {} exceeded its category's runtime limit", taskid);
            self.fast_abort_task(taskid).await;
        }
    }

    async fn fast_abort_task(&mut self, taskid: u64) {
        if let Some(task) = self.tasks.get_mut(&taskid) {
            task.fast_abort_count += 1;
        }
        let alarm_worker = self.worker_of_task.get(&taskid).cloned();
        self.abort_and_requeue(taskid).await;
        if let Some(hashkey) = alarm_worker {
            let already_alarmed = self
                .workers
                .get(&hashkey)
                .map(|w| w.fast_abort_alarm)
                .unwrap_or(false);
            if already_alarmed {
                self.remove_worker(&hashkey, DisconnectReason::FastAbort).await;
            } else if let Some(worker) = self.workers.get_mut(&hashkey) {
                worker.fast_abort_alarm = true;
            }
        }
    }

    /// Kill a task at its worker and put it back on the ready queue.
    async fn abort_and_requeue(&mut self, taskid: u64) {
        self.detach_task(taskid).await;
        if let Some(task) = self.tasks.get_mut(&taskid) {
            task.clean(false);
            self.enqueue_ready(taskid, true);
        }
    }

    async fn release_drained_workers(&mut self) {
        let drained: Vec<String> = self
            .workers
            .values()
            .filter(|w| w.worker_type == WorkerType::Worker && w.draining && w.is_idle())
            .map(|w| w.hashkey.clone())
            .collect();
        for hashkey in drained {
            self.remove_worker(&hashkey, DisconnectReason::Released).await;
        }
    }

    /// Warn about ready tasks no connected worker could ever fit.
    fn check_large_tasks(&mut self, now: u64) {
        let interval = self.config.scheduling.large_task_check_interval_secs * 1_000_000;
        if now.saturating_sub(self.time_last_large_task_check) < interval {
            return;
        }
        self.time_last_large_task_check = now;

        let have_workers = self
            .workers
            .values()
            .any(|w| w.worker_type == WorkerType::Worker && w.has_reported_resources());
        if !have_workers {
            return;
        }
        let oversized: Vec<(u64, Resources)> = self
            .ready
            .iter()
            .filter_map(|taskid| self.tasks.get(taskid))
            .map(|task| {
                (
                    task.taskid,
                    self.scheduler.effective_allocation(task, &self.categories),
                )
            })
            .filter(|(_, allocation)| !self.scheduler.fits_any_worker(allocation, &self.workers))
            .collect();
        for (taskid, allocation) in oversized {
            warn!(
                "task {} needs more resources ({}) than any connected worker",
                taskid, allocation
            );
            if let Some(txn) = &mut self.txn_log {
                txn.large_task(now, taskid, &allocation);
            }
        }
    }

    async fn announce_catalog(&mut self, now: u64) {
        if self.catalog.is_none() {
            return;
        }
        self.refresh_gauges();
        let update = CatalogUpdate::from_stats(
            self.config.name.as_deref().unwrap_or("taskforge"),
            &self.instance_id,
            self.port,
            self.config.priority,
            &self.stats,
        );
        if let Some(announcer) = self.catalog.as_mut() {
            announcer.tick(&update, now).await;
        }
    }

    fn flush_perf_log(&mut self, now: u64) {
        if self.perf_log.is_none() {
            return;
        }
        self.refresh_gauges();
        if let Some(log) = self.perf_log.as_mut() {
            log.write_update(&self.stats, now, false);
        }
    }

    /// Recompute the instantaneous gauges from the live tables.
    fn refresh_gauges(&mut self) {
        let workers: Vec<&Worker> = self
            .workers
            .values()
            .filter(|w| w.worker_type == WorkerType::Worker)
            .collect();
        self.stats.workers_connected = workers.len() as u64;
        self.stats.workers_init = workers
            .iter()
            .filter(|w| !w.has_reported_resources())
            .count() as u64;
        self.stats.workers_idle = workers.iter().filter(|w| w.is_idle()).count() as u64;
        self.stats.workers_busy = workers.iter().filter(|w| !w.is_idle()).count() as u64;

        let mut total = Resources::zero();
        let mut committed = Resources::zero();
        for worker in &workers {
            if worker.has_reported_resources() {
                total.accumulate(&worker.resources);
            }
            committed.accumulate(&worker.committed);
        }
        self.stats.total_resources = total;
        self.stats.committed_resources = committed;

        let largest = self
            .ready
            .iter()
            .filter_map(|taskid| self.tasks.get(taskid))
            .map(|task| self.scheduler.effective_allocation(task, &self.categories))
            .fold(Resources::unset(), |acc, allocation| acc.widen(&allocation));
        self.stats.workers_able = if largest.is_unset() {
            self.stats.workers_connected
        } else {
            workers
                .iter()
                .filter(|w| {
                    w.has_reported_resources()
                        && largest.fits_in(&w.resources.available(
                            &Resources::zero(),
                            self.config.scheduling.submit_multiplier,
                        ))
                })
                .count() as u64
        };

        self.stats.tasks_waiting = self.ready.len() as u64;
        self.stats.tasks_on_workers = self.worker_of_task.len() as u64;
        self.stats.tasks_running = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .count() as u64;
        self.stats.tasks_with_results = self.retrieved.len() as u64;
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(txn) = &mut self.txn_log {
            txn.coordinator(timestamp_us(), "END");
        }
    }
}
