//! Core coordinator engine for TaskForge.
//!
//! This module contains the subsystems that together implement the
//! distributed task-execution core: task and worker records, artifact
//! descriptors, categories, the scheduler, the wire protocol, and the
//! coordinator event loop with its put/get transfer pipelines.
//!
//! Each subsystem is organized into its own submodule:
//! - `artifact` for input/output descriptors and cache fingerprints
//! - `category` for per-label resource policy and autolabeling
//! - `coordinator` for the event loop, dispatcher, and transfer pipelines
//! - `link` for buffered non-blocking worker connections
//! - `protocol` for wire message parsing and name encoding
//! - `resources` for resource-vector arithmetic
//! - `scheduler` for (task, worker) selection policies
//! - `stats` for aggregate counters
//! - `task` and `worker` for the two principal record types

pub mod artifact;
pub mod category;
pub mod coordinator;
pub mod fs_util;
pub mod link;
pub mod protocol;
pub mod resources;
pub mod scheduler;
pub mod stats;
pub mod task;
pub mod worker;

pub use artifact::{Artifact, ArtifactFlags, ArtifactKind};
pub use category::{AllocationMode, AutolabelBits, Category};
pub use coordinator::Coordinator;
pub use resources::Resources;
pub use scheduler::SchedulePolicy;
pub use stats::CoordinatorStats;
pub use task::{ResultCode, Task, TaskState};

/// Current time in microseconds since the Unix epoch.
pub(crate) fn timestamp_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
