//! Task records: the unit of work submitted to the coordinator.
//!
//! A [`Task`] carries a shell command (or coprocess invocation), its named
//! input and output artifacts, environment, resource requests, and all the
//! per-attempt state the coordinator tracks across submission, dispatch,
//! execution, retrieval, and completion.
//!
//! # States
//!
//! ```text
//! READY ──dispatch──▶ RUNNING ──result──▶ WAITING_RETRIEVAL ──get──▶ RETRIEVED ──wait──▶ DONE
//! READY | RUNNING | WAITING_RETRIEVAL ──cancel──▶ CANCELED
//! RUNNING ──worker lost / retryable failure──▶ READY
//! ```
//!
//! A task is on exactly one of the ready queue, a worker's in-flight set, or
//! the retrieved queue while in a non-terminal state.

use super::artifact::{Artifact, ArtifactFlags};
use super::resources::Resources;
use super::scheduler::SchedulePolicy;
use crate::Result;
use crate::error::TaskForgeError;
use log::warn;
use std::path::PathBuf;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in the ready queue.
    Ready,
    /// Dispatched to a worker.
    Running,
    /// Finished at the worker; outputs not yet transferred back.
    WaitingRetrieval,
    /// Outputs transferred; waiting to be returned through `wait`.
    Retrieved,
    /// Returned to the caller.
    Done,
    /// Canceled before completion.
    Canceled,
    /// No such task.
    Unknown,
}

/// Terminal classification of a task attempt.
///
/// Wire codes mirror the worker protocol: the three low bits are the
/// "missing" diagnoses, everything above is a high-order error that clobbers
/// them (see [`Task::update_result`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// The task ran successfully.
    Success,
    /// A declared input could not be provided.
    InputMissing,
    /// The task ran but a declared output was not produced.
    OutputMissing,
    /// The task ran but its stdout was truncated.
    StdoutMissing,
    /// The task was terminated by a signal.
    Signal,
    /// The task used more resources than allocated.
    ResourceExhaustion,
    /// The task ran past its absolute end time.
    TaskTimeout,
    /// The result could not be classified.
    Unknown,
    /// The task failed through no fault of its own (worker loss).
    Forsaken,
    /// The task ran out of retry attempts.
    MaxRetries,
    /// The task exceeded its per-attempt running time.
    TaskMaxRunTime,
    /// The task filled its disk allocation.
    DiskAllocFull,
    /// The resource monitor failed to produce a summary.
    MonitorError,
    /// An output could not be stored at the coordinator.
    OutputTransferError,
}

impl ResultCode {
    /// Numeric code used on the wire and in logs.
    pub fn to_wire(self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::InputMissing => 1,
            ResultCode::OutputMissing => 2,
            ResultCode::StdoutMissing => 4,
            ResultCode::Signal => 1 << 3,
            ResultCode::ResourceExhaustion => 2 << 3,
            ResultCode::TaskTimeout => 3 << 3,
            ResultCode::Unknown => 4 << 3,
            ResultCode::Forsaken => 5 << 3,
            ResultCode::MaxRetries => 6 << 3,
            ResultCode::TaskMaxRunTime => 7 << 3,
            ResultCode::DiskAllocFull => 8 << 3,
            ResultCode::MonitorError => 9 << 3,
            ResultCode::OutputTransferError => 10 << 3,
        }
    }

    /// Decode a wire status integer; anything unrecognized maps to `Unknown`.
    pub fn from_wire(code: u32) -> Self {
        match code {
            0 => ResultCode::Success,
            1 => ResultCode::InputMissing,
            2 => ResultCode::OutputMissing,
            4 => ResultCode::StdoutMissing,
            8 => ResultCode::Signal,
            16 => ResultCode::ResourceExhaustion,
            24 => ResultCode::TaskTimeout,
            40 => ResultCode::Forsaken,
            48 => ResultCode::MaxRetries,
            56 => ResultCode::TaskMaxRunTime,
            64 => ResultCode::DiskAllocFull,
            72 => ResultCode::MonitorError,
            80 => ResultCode::OutputTransferError,
            _ => ResultCode::Unknown,
        }
    }

    /// True for codes above the missing-* bits.
    pub fn is_high_order(self) -> bool {
        self.to_wire() & !0x7 != 0
    }
}

/// Which allocation bucket the next attempt draws from.
///
/// Tasks start at `First`; a resource-exhaustion failure widens the next
/// attempt to `Max`. Exhaustion at `Max` is permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationBucket {
    /// First-allocation guess (category autolabel or user request).
    First,
    /// Category maximum bounds.
    Max,
}

/// A user-submitted unit of work.
///
/// Construct with [`Task::new`], refine with the `specify_*` methods, then
/// pass to `Coordinator::submit`. After the task comes back through `wait`,
/// inspect `result`, `exit_code`, and `output`.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique id, assigned at submission. Zero before first submit.
    pub taskid: u64,
    /// Shell command line executed by the worker.
    pub command: String,
    /// Coprocess name executing the command, if any. Dispatch requires the
    /// worker to advertise the matching coprocess feature.
    pub coprocess: Option<String>,
    /// Category label grouping tasks with similar resource use.
    pub category: String,
    /// Free-form user tag, selectable in `wait_for_tag`.
    pub tag: Option<String>,
    /// Scheduling priority; higher is served first by policies that consult it.
    pub priority: f64,
    /// Declared input artifacts.
    pub inputs: Vec<Artifact>,
    /// Declared output artifacts.
    pub outputs: Vec<Artifact>,
    /// Environment variables set for the command.
    pub env: Vec<(String, String)>,
    /// Features the executing worker must advertise.
    pub features: Vec<String>,
    /// Per-task scheduling policy override.
    pub policy: Option<SchedulePolicy>,

    /// Resources requested by the user (unset fields defer to the category).
    pub resources_requested: Resources,
    /// Resources allocated at dispatch.
    pub resources_allocated: Resources,
    /// Peak resources measured by the worker.
    pub resources_measured: Resources,
    /// Allocation bucket for the next attempt.
    pub resource_request: AllocationBucket,

    /// Maximum per-attempt running time, microseconds.
    pub wall_time_us: Option<u64>,
    /// Absolute end time (microseconds since epoch) after which the task is
    /// no longer useful.
    pub end_time_us: Option<u64>,
    /// Earliest time (microseconds since epoch) the task may start.
    pub start_time_min_us: Option<u64>,
    /// Workers whose advertised end time leaves less than this are skipped.
    pub min_running_time_us: Option<u64>,
    /// Attempt bound; zero means retry indefinitely.
    pub max_retries: u32,

    /// Current lifecycle state.
    pub state: TaskState,
    /// Terminal classification (Unknown until decided).
    pub result: ResultCode,
    /// Process exit code reported by the worker (-1 until known).
    pub exit_code: i64,

    /// Hashkey of the worker running the current attempt.
    pub worker_hashkey: Option<String>,
    /// Hostname of that worker, for reporting.
    pub hostname: Option<String>,
    /// address:port of that worker, for reporting.
    pub addrport: Option<String>,

    /// Dispatch attempts so far.
    pub try_count: u32,
    /// Attempts that ended in resource exhaustion.
    pub exhausted_attempts: u32,
    /// Times this task was killed by the fast-abort policy.
    pub fast_abort_count: u32,

    /// When the task was submitted, microseconds since epoch.
    pub time_when_submitted: u64,
    /// When the current dispatch started.
    pub time_when_commit_start: u64,
    /// When the current dispatch (envelope + inputs) completed.
    pub time_when_commit_end: u64,
    /// When output retrieval completed.
    pub time_when_retrieval: u64,
    /// When the task was returned through `wait`.
    pub time_when_done: u64,
    /// Execution time of the last attempt, microseconds.
    pub time_workers_execute_last: u64,
    /// Execution time summed over all attempts.
    pub time_workers_execute_all: u64,

    /// File bytes sent to workers for this task.
    pub bytes_sent: u64,
    /// File bytes received back for this task.
    pub bytes_received: u64,
    /// Total bytes moved in either direction.
    pub bytes_transferred: u64,

    /// Captured stdout of the last attempt.
    pub output: Option<Vec<u8>>,
    /// Directory receiving resource-monitor artifacts, when monitoring.
    pub monitor_output_directory: Option<PathBuf>,
    /// Remote name of the monitor summary output, when monitoring.
    pub monitor_summary_remote: Option<String>,
}

impl Task {
    /// Create a task that runs `command` on some worker.
    pub fn new(command: &str) -> Self {
        Task {
            taskid: 0,
            command: command.to_string(),
            coprocess: None,
            category: "default".to_string(),
            tag: None,
            priority: 0.0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            env: Vec::new(),
            features: Vec::new(),
            policy: None,
            resources_requested: Resources::unset(),
            resources_allocated: Resources::unset(),
            resources_measured: Resources::unset(),
            resource_request: AllocationBucket::First,
            wall_time_us: None,
            end_time_us: None,
            start_time_min_us: None,
            min_running_time_us: None,
            max_retries: 0,
            state: TaskState::Ready,
            result: ResultCode::Unknown,
            exit_code: -1,
            worker_hashkey: None,
            hostname: None,
            addrport: None,
            try_count: 0,
            exhausted_attempts: 0,
            fast_abort_count: 0,
            time_when_submitted: 0,
            time_when_commit_start: 0,
            time_when_commit_end: 0,
            time_when_retrieval: 0,
            time_when_done: 0,
            time_workers_execute_last: 0,
            time_workers_execute_all: 0,
            bytes_sent: 0,
            bytes_received: 0,
            bytes_transferred: 0,
            output: None,
            monitor_output_directory: None,
            monitor_summary_remote: None,
        }
    }

    /// Create a resubmittable copy of this task.
    ///
    /// Static features (command, artifacts, environment, scheduling hints)
    /// are copied; attempt state, results, and metrics start fresh. Non-cached
    /// artifacts get new fingerprints so the copy never shares a deletable
    /// worker-side file with the original.
    pub fn clone_task(&self) -> Self {
        let mut new = Task::new(&self.command);
        new.coprocess = self.coprocess.clone();
        new.category = self.category.clone();
        new.tag = self.tag.clone();
        new.priority = self.priority;
        new.inputs = self.inputs.iter().map(|a| a.clone_for_resubmit()).collect();
        new.outputs = self.outputs.iter().map(|a| a.clone_for_resubmit()).collect();
        new.env = self.env.clone();
        new.features = self.features.clone();
        new.policy = self.policy;
        new.resources_requested = self.resources_requested;
        new.wall_time_us = self.wall_time_us;
        new.end_time_us = self.end_time_us;
        new.start_time_min_us = self.start_time_min_us;
        new.min_running_time_us = self.min_running_time_us;
        new.max_retries = self.max_retries;
        new.monitor_output_directory = self.monitor_output_directory.clone();
        new.monitor_summary_remote = self.monitor_summary_remote.clone();
        new
    }

    /// Replace the command line.
    pub fn specify_command(&mut self, command: &str) {
        self.command = command.to_string();
    }

    /// Route execution through a named coprocess at the worker.
    pub fn specify_coprocess(&mut self, name: &str) {
        self.coprocess = Some(name.to_string());
    }

    /// Attach a user tag.
    pub fn specify_tag(&mut self, tag: &str) {
        self.tag = Some(tag.to_string());
    }

    /// Assign the task to a category.
    pub fn specify_category(&mut self, category: &str) {
        self.category = category.to_string();
    }

    /// Set the scheduling priority.
    pub fn specify_priority(&mut self, priority: f64) {
        self.priority = priority;
    }

    /// Add an environment variable for the command.
    pub fn specify_env(&mut self, name: &str, value: &str) {
        self.env.push((name.to_string(), value.to_string()));
    }

    /// Require a worker feature.
    pub fn specify_feature(&mut self, feature: &str) {
        if !self.features.iter().any(|f| f == feature) {
            self.features.push(feature.to_string());
        }
    }

    /// Override the global scheduling policy for this task.
    pub fn specify_policy(&mut self, policy: SchedulePolicy) {
        self.policy = Some(policy);
    }

    fn push_input(&mut self, artifact: Artifact) -> Result<()> {
        if self
            .inputs
            .iter()
            .any(|existing| existing.remote_name == artifact.remote_name)
        {
            warn!(
                "task input '{}' duplicates an existing remote name; ignoring",
                artifact.remote_name
            );
            return Ok(());
        }
        self.inputs.push(artifact);
        Ok(())
    }

    fn push_output(&mut self, artifact: Artifact) -> Result<()> {
        if self
            .outputs
            .iter()
            .any(|existing| existing.source == artifact.source)
        {
            warn!(
                "task output '{}' duplicates an existing local destination; ignoring",
                artifact.source
            );
            return Ok(());
        }
        self.outputs.push(artifact);
        Ok(())
    }

    /// Add a local file as a task input.
    pub fn specify_input_file(
        &mut self,
        local_name: &str,
        remote_name: &str,
        flags: ArtifactFlags,
    ) -> Result<()> {
        self.push_input(Artifact::file(local_name, remote_name, flags)?)
    }

    /// Declare an output file to be fetched back to `local_name`.
    pub fn specify_output_file(
        &mut self,
        local_name: &str,
        remote_name: &str,
        flags: ArtifactFlags,
    ) -> Result<()> {
        self.push_output(Artifact::file(local_name, remote_name, flags)?)
    }

    /// Add a byte range of a local file as an input.
    pub fn specify_input_piece(
        &mut self,
        local_name: &str,
        remote_name: &str,
        start_byte: u64,
        end_byte: u64,
        flags: ArtifactFlags,
    ) -> Result<()> {
        if end_byte < start_byte {
            return Err(TaskForgeError::specification(format!(
                "file piece range {}..{} is inverted",
                start_byte, end_byte
            )));
        }
        self.push_input(Artifact::file_piece(
            local_name,
            remote_name,
            start_byte,
            end_byte - start_byte + 1,
            flags,
        )?)
    }

    /// Add inline data as an input file.
    pub fn specify_input_buffer(
        &mut self,
        data: &[u8],
        remote_name: &str,
        flags: ArtifactFlags,
    ) -> Result<()> {
        self.push_input(Artifact::buffer(data.to_vec(), remote_name, flags)?)
    }

    /// Add a local directory (recursively) as an input.
    pub fn specify_input_directory(
        &mut self,
        local_name: &str,
        remote_name: &str,
        flags: ArtifactFlags,
    ) -> Result<()> {
        self.push_input(Artifact::directory(local_name, remote_name, flags)?)
    }

    /// Have the worker create an empty directory in the sandbox.
    pub fn specify_empty_directory(&mut self, remote_name: &str) -> Result<()> {
        self.push_input(Artifact::empty_directory(remote_name, ArtifactFlags::default())?)
    }

    /// Add a URL input; the worker fetches it into its cache.
    pub fn specify_input_url(
        &mut self,
        url: &str,
        remote_name: &str,
        flags: ArtifactFlags,
    ) -> Result<()> {
        self.push_input(Artifact::url(url, remote_name, flags)?)
    }

    /// Add an input produced by running `cmd` at the worker.
    pub fn specify_input_command(
        &mut self,
        cmd: &str,
        remote_name: &str,
        flags: ArtifactFlags,
    ) -> Result<()> {
        self.push_input(Artifact::command(cmd, remote_name, flags)?)
    }

    /// Request processor cores.
    pub fn specify_cores(&mut self, cores: i64) {
        self.resources_requested.cores = cores;
    }

    /// Request memory in megabytes.
    pub fn specify_memory(&mut self, memory: i64) {
        self.resources_requested.memory = memory;
    }

    /// Request disk space in megabytes.
    pub fn specify_disk(&mut self, disk: i64) {
        self.resources_requested.disk = disk;
    }

    /// Request GPU devices.
    pub fn specify_gpus(&mut self, gpus: i64) {
        self.resources_requested.gpus = gpus;
    }

    /// Bound the per-attempt running time, in seconds.
    pub fn specify_wall_time(&mut self, seconds: u64) {
        self.wall_time_us = if seconds == 0 {
            None
        } else {
            Some(seconds * 1_000_000)
        };
    }

    /// Set the absolute end time in microseconds since the epoch.
    pub fn specify_end_time(&mut self, useconds: u64) {
        self.end_time_us = if useconds == 0 { None } else { Some(useconds) };
    }

    /// Set the earliest start time in microseconds since the epoch.
    pub fn specify_start_time_min(&mut self, useconds: u64) {
        self.start_time_min_us = if useconds == 0 { None } else { Some(useconds) };
    }

    /// Skip workers that will terminate in less than this many microseconds.
    pub fn specify_running_time_min(&mut self, useconds: u64) {
        self.min_running_time_us = if useconds == 0 { None } else { Some(useconds) };
    }

    /// Bound the number of attempts; zero retries indefinitely.
    pub fn specify_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    /// Enable monitor-summary collection into `directory`.
    ///
    /// The summary is declared as an output with remote name
    /// `taskforge-monitor-summary` and fetched at minimum whenever the task
    /// fails.
    pub fn specify_monitor_output(&mut self, directory: &str) -> Result<()> {
        let remote = "taskforge-monitor-summary";
        let local = PathBuf::from(directory).join(format!("task-{}.summary", self.taskid));
        self.monitor_output_directory = Some(PathBuf::from(directory));
        self.monitor_summary_remote = Some(remote.to_string());
        self.push_output(Artifact::file(&local.to_string_lossy(), remote, ArtifactFlags::default())?)
    }

    /// True once the task can be submitted: it has a command or coprocess.
    pub fn is_submittable(&self) -> bool {
        !self.command.is_empty() || self.coprocess.is_some()
    }

    /// True if the attempt both reported success and exited zero.
    pub fn succeeded(&self) -> bool {
        self.result == ResultCode::Success && self.exit_code == 0
    }

    /// Sum of input source sizes, used by the FILES policy.
    pub fn input_footprint(&self) -> u64 {
        self.inputs.iter().map(|a| a.footprint()).sum()
    }

    /// Reset transient per-attempt state so the task can be dispatched again.
    ///
    /// A full clean additionally resets retry accounting and the
    /// allocated/measured summaries, returning the task to the state of a
    /// fresh submission.
    pub fn clean(&mut self, full: bool) {
        self.time_when_commit_start = 0;
        self.time_when_commit_end = 0;
        self.time_when_retrieval = 0;
        self.time_workers_execute_last = 0;

        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.bytes_transferred = 0;

        self.output = None;
        self.hostname = None;
        self.addrport = None;
        self.worker_hashkey = None;

        if full {
            self.resource_request = AllocationBucket::First;
            self.try_count = 0;
            self.exhausted_attempts = 0;
            self.fast_abort_count = 0;
            self.time_workers_execute_all = 0;
            self.resources_measured = Resources::unset();
            self.resources_allocated = Resources::unset();
        }

        self.result = ResultCode::Unknown;
        self.exit_code = -1;
        self.state = TaskState::Ready;
    }

    /// Fold a new result code into the task under the precedence rules.
    ///
    /// High-order codes overwrite anything; once one is set, later missing-*
    /// signals are supplementary and ignored. Among the missing codes,
    /// input-missing (known before dispatch) sticks against later
    /// output-missing, which in turn displaces stdout-missing. The result
    /// never reverts to `Unknown`.
    pub fn update_result(&mut self, new_result: ResultCode) -> ResultCode {
        let current_is_decided =
            self.result != ResultCode::Unknown && self.result.is_high_order();
        if new_result.is_high_order() {
            self.result = new_result;
        } else if current_is_decided {
            // keep the earlier high-order diagnosis
        } else {
            match new_result {
                ResultCode::InputMissing => self.result = new_result,
                ResultCode::OutputMissing => {
                    if self.result != ResultCode::InputMissing {
                        self.result = new_result;
                    }
                }
                ResultCode::StdoutMissing => {
                    if self.result == ResultCode::Unknown {
                        self.result = new_result;
                    }
                }
                _ => {
                    if self.result == ResultCode::Unknown {
                        self.result = new_result;
                    }
                }
            }
        }
        self.result
    }
}
