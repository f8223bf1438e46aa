//! Scheduling: choosing a (task, worker) pairing under the active policy.
//!
//! Task selection walks the priority-ordered ready queue; worker selection
//! applies the policy among the eligible workers for that task. Eligibility
//! enforces resource fit (with the submit multiplier), feature requirements,
//! blocklist and draining state, and end-time feasibility. The effective
//! per-attempt allocation is derived from the task's category and its
//! current allocation bucket before any worker is considered.

use super::category::Category;
use super::resources::Resources;
use super::task::{AllocationBucket, Task, TaskState};
use super::worker::{Worker, WorkerType};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Worker-selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulePolicy {
    /// First eligible worker, oldest connection first.
    Fcfs,
    /// A random eligible worker (default).
    Rand,
    /// The worker already caching the most input bytes for the task.
    Files,
    /// The worker with the shortest observed mean execution time.
    Time,
    /// The worker with the most free resources (worst fit).
    Worst,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        SchedulePolicy::Rand
    }
}

/// A scheduling decision: dispatch `taskid` to `hashkey` with `allocation`.
#[derive(Debug, Clone)]
pub struct Placement {
    /// Selected task.
    pub taskid: u64,
    /// Selected worker's hashkey.
    pub hashkey: String,
    /// Effective per-attempt allocation to commit.
    pub allocation: Resources,
}

/// The coordinator's scheduling component.
#[derive(Debug)]
pub struct Scheduler {
    /// Global worker-selection policy; tasks may override it.
    pub policy: SchedulePolicy,
    /// Overcommit factor applied to worker totals during the fit check.
    pub submit_multiplier: f64,
}

impl Scheduler {
    /// Create a scheduler with the given global policy.
    pub fn new(policy: SchedulePolicy, submit_multiplier: f64) -> Self {
        Scheduler {
            policy,
            submit_multiplier,
        }
    }

    /// Pick the next (task, worker) pairing, or `None` if nothing fits.
    ///
    /// Walks the ready queue in order (the queue is kept priority-sorted by
    /// the coordinator) and returns the first task for which an eligible
    /// worker exists.
    pub fn select(
        &self,
        ready: &VecDeque<u64>,
        tasks: &HashMap<u64, Task>,
        workers: &HashMap<String, Worker>,
        categories: &HashMap<String, Category>,
        blocked_hosts: &HashSet<String>,
        now_us: u64,
    ) -> Option<Placement> {
        for taskid in ready {
            let task = match tasks.get(taskid) {
                Some(t) if t.state == TaskState::Ready => t,
                _ => continue,
            };
            if let Some(start_min) = task.start_time_min_us {
                if now_us < start_min {
                    continue;
                }
            }
            let allocation = self.effective_allocation(task, categories);
            let policy = task.policy.unwrap_or(self.policy);
            if let Some(hashkey) =
                self.choose_worker(task, &allocation, policy, workers, categories, blocked_hosts, now_us)
            {
                return Some(Placement {
                    taskid: *taskid,
                    hashkey,
                    allocation,
                });
            }
        }
        None
    }

    /// Effective per-attempt allocation for `task` under its category.
    pub fn effective_allocation(
        &self,
        task: &Task,
        categories: &HashMap<String, Category>,
    ) -> Resources {
        match categories.get(&task.category) {
            Some(category) => {
                category.effective_allocation(&task.resources_requested, task.resource_request)
            }
            None => {
                // Unregistered label: behave like a fresh fixed category.
                Category::new(&task.category)
                    .effective_allocation(&task.resources_requested, task.resource_request)
            }
        }
    }

    /// True if `worker` may run `task` with `allocation` right now.
    pub fn eligible(
        &self,
        task: &Task,
        allocation: &Resources,
        worker: &Worker,
        categories: &HashMap<String, Category>,
        blocked_hosts: &HashSet<String>,
        now_us: u64,
    ) -> bool {
        if worker.worker_type != WorkerType::Worker
            || !worker.authenticated
            || !worker.has_reported_resources()
            || worker.draining
        {
            return false;
        }
        if blocked_hosts.contains(worker.host()) {
            return false;
        }
        if !allocation.fits_in(&worker.available(self.submit_multiplier)) {
            return false;
        }
        if !worker.has_features(&task.features) {
            return false;
        }
        if let Some(coprocess) = &task.coprocess {
            if !worker.features.contains(&format!("coprocess-{}", coprocess)) {
                return false;
            }
        }
        // A task with a deadline is not dispatched if the expected runtime
        // already overshoots it.
        if let Some(end_time) = task.end_time_us {
            let estimate = categories
                .get(&task.category)
                .and_then(|c| c.average_task_time())
                .unwrap_or(0);
            if now_us + estimate >= end_time {
                return false;
            }
        }
        if let Some(worker_end) = worker.end_time_us {
            let remaining = worker_end.saturating_sub(now_us);
            if remaining < task.min_running_time_us.unwrap_or(0) {
                return false;
            }
        }
        true
    }

    fn choose_worker(
        &self,
        task: &Task,
        allocation: &Resources,
        policy: SchedulePolicy,
        workers: &HashMap<String, Worker>,
        categories: &HashMap<String, Category>,
        blocked_hosts: &HashSet<String>,
        now_us: u64,
    ) -> Option<String> {
        let mut eligible: Vec<&Worker> = workers
            .values()
            .filter(|w| self.eligible(task, allocation, w, categories, blocked_hosts, now_us))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let chosen = match policy {
            SchedulePolicy::Fcfs => eligible
                .iter()
                .min_by_key(|w| w.start_time)
                .copied(),
            SchedulePolicy::Rand => eligible.choose(&mut rand::thread_rng()).copied(),
            SchedulePolicy::Files => {
                let fingerprints: Vec<&str> =
                    task.inputs.iter().map(|a| a.fingerprint.as_str()).collect();
                eligible
                    .iter()
                    .max_by_key(|w| w.cache_hit_bytes(&fingerprints))
                    .copied()
            }
            SchedulePolicy::Time => {
                eligible.sort_by_key(|w| w.start_time);
                eligible
                    .iter()
                    .min_by_key(|w| w.mean_task_time().unwrap_or(0))
                    .copied()
            }
            SchedulePolicy::Worst => eligible
                .iter()
                .max_by_key(|w| w.available(self.submit_multiplier).slack_score())
                .copied(),
        };
        chosen.map(|w| w.hashkey.clone())
    }

    /// True if `allocation` fits the advertised total of at least one worker,
    /// ignoring commitments. Used by the periodic large-task check.
    pub fn fits_any_worker(
        &self,
        allocation: &Resources,
        workers: &HashMap<String, Worker>,
    ) -> bool {
        workers
            .values()
            .filter(|w| w.worker_type == WorkerType::Worker && w.has_reported_resources())
            .any(|w| allocation.fits_in(&w.resources.available(&Resources::zero(), self.submit_multiplier)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::link::Link;
    use tokio::net::{TcpListener, TcpStream};

    async fn worker_with(cores: i64, hashkey: &str) -> Worker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let _server = listener.accept().await.unwrap();
        let mut w = Worker::new(Link::new(client), 0);
        w.worker_type = WorkerType::Worker;
        w.authenticated = true;
        w.hashkey = hashkey.to_string();
        w.resources = Resources::new(cores, 16000, 100000, 0);
        w
    }

    fn ready_of(tasks: &[&Task]) -> VecDeque<u64> {
        tasks.iter().map(|t| t.taskid).collect()
    }

    #[tokio::test]
    async fn oversized_task_is_never_placed() {
        let scheduler = Scheduler::new(SchedulePolicy::Fcfs, 1.0);
        let mut task = Task::new("big");
        task.taskid = 1;
        task.specify_cores(2);

        let mut tasks = HashMap::new();
        tasks.insert(1, task);
        let mut workers = HashMap::new();
        workers.insert("w1".to_string(), worker_with(1, "w1").await);

        let placement = scheduler.select(
            &ready_of(&[&tasks[&1]]),
            &tasks,
            &workers,
            &HashMap::new(),
            &HashSet::new(),
            0,
        );
        assert!(placement.is_none());
        assert!(!scheduler.fits_any_worker(&Resources::new(2, 0, 0, 0), &workers));
    }

    #[tokio::test]
    async fn committed_resources_block_second_dispatch() {
        let scheduler = Scheduler::new(SchedulePolicy::Fcfs, 1.0);
        let mut task = Task::new("unit");
        task.taskid = 1;
        task.specify_cores(1);
        let mut tasks = HashMap::new();
        tasks.insert(1, task);

        let mut worker = worker_with(1, "w1").await;
        worker.commit_task(9, Resources::new(1, 0, 0, 0));
        let mut workers = HashMap::new();
        workers.insert("w1".to_string(), worker);

        let placement = scheduler.select(
            &ready_of(&[&tasks[&1]]),
            &tasks,
            &workers,
            &HashMap::new(),
            &HashSet::new(),
            0,
        );
        assert!(placement.is_none());
    }

    #[tokio::test]
    async fn submit_multiplier_permits_overcommit() {
        let scheduler = Scheduler::new(SchedulePolicy::Fcfs, 2.0);
        let mut task = Task::new("unit");
        task.taskid = 1;
        task.specify_cores(1);
        let mut tasks = HashMap::new();
        tasks.insert(1, task);

        let mut worker = worker_with(1, "w1").await;
        worker.commit_task(9, Resources::new(1, 0, 0, 0));
        let mut workers = HashMap::new();
        workers.insert("w1".to_string(), worker);

        let placement = scheduler.select(
            &ready_of(&[&tasks[&1]]),
            &tasks,
            &workers,
            &HashMap::new(),
            &HashSet::new(),
            0,
        );
        assert!(placement.is_some());
    }

    #[tokio::test]
    async fn features_and_coprocess_gate_eligibility() {
        let scheduler = Scheduler::new(SchedulePolicy::Fcfs, 1.0);
        let mut task = Task::new("unit");
        task.taskid = 1;
        task.specify_feature("gpu-compute");
        task.specify_coprocess("align");
        let mut tasks = HashMap::new();
        tasks.insert(1, task);

        let mut plain = worker_with(4, "plain").await;
        plain.features.insert("gpu-compute".to_string());
        let mut full = worker_with(4, "full").await;
        full.features.insert("gpu-compute".to_string());
        full.features.insert("coprocess-align".to_string());

        let mut workers = HashMap::new();
        workers.insert("plain".to_string(), plain);
        workers.insert("full".to_string(), full);

        let placement = scheduler
            .select(
                &ready_of(&[&tasks[&1]]),
                &tasks,
                &workers,
                &HashMap::new(),
                &HashSet::new(),
                0,
            )
            .unwrap();
        assert_eq!(placement.hashkey, "full");
    }

    #[tokio::test]
    async fn blocked_and_draining_workers_are_skipped() {
        let scheduler = Scheduler::new(SchedulePolicy::Fcfs, 1.0);
        let mut task = Task::new("unit");
        task.taskid = 1;
        let mut tasks = HashMap::new();
        tasks.insert(1, task);

        let blocked = worker_with(4, "blocked").await;
        let blocked_host = blocked.host().to_string();
        let mut draining = worker_with(4, "draining").await;
        draining.draining = true;

        let mut workers = HashMap::new();
        workers.insert("blocked".to_string(), blocked);
        workers.insert("draining".to_string(), draining);

        let mut blocked_hosts = HashSet::new();
        blocked_hosts.insert(blocked_host);

        let placement = scheduler.select(
            &ready_of(&[&tasks[&1]]),
            &tasks,
            &workers,
            &HashMap::new(),
            &blocked_hosts,
            0,
        );
        assert!(placement.is_none());
    }

    #[tokio::test]
    async fn files_policy_prefers_cache_affinity() {
        let scheduler = Scheduler::new(SchedulePolicy::Files, 1.0);
        let mut task = Task::new("consume");
        task.taskid = 1;
        task.specify_input_command("make-data", "data", crate::core::artifact::ArtifactFlags::cached())
            .unwrap();
        let fingerprint = task.inputs[0].fingerprint.clone();
        let mut tasks = HashMap::new();
        tasks.insert(1, task);

        let cold = worker_with(4, "cold").await;
        let mut warm = worker_with(4, "warm").await;
        warm.cache.insert(
            fingerprint,
            crate::core::worker::CachedArtifactInfo {
                size: 4096,
                mtime: 0,
                transfer_time: 0,
            },
        );

        let mut workers = HashMap::new();
        workers.insert("cold".to_string(), cold);
        workers.insert("warm".to_string(), warm);

        let placement = scheduler
            .select(
                &ready_of(&[&tasks[&1]]),
                &tasks,
                &workers,
                &HashMap::new(),
                &HashSet::new(),
                0,
            )
            .unwrap();
        assert_eq!(placement.hashkey, "warm");
    }

    #[tokio::test]
    async fn worst_policy_prefers_most_free_resources() {
        let scheduler = Scheduler::new(SchedulePolicy::Worst, 1.0);
        let mut task = Task::new("unit");
        task.taskid = 1;
        let mut tasks = HashMap::new();
        tasks.insert(1, task);

        let small = worker_with(2, "small").await;
        let big = worker_with(16, "big").await;
        let mut workers = HashMap::new();
        workers.insert("small".to_string(), small);
        workers.insert("big".to_string(), big);

        let placement = scheduler
            .select(
                &ready_of(&[&tasks[&1]]),
                &tasks,
                &workers,
                &HashMap::new(),
                &HashSet::new(),
                0,
            )
            .unwrap();
        assert_eq!(placement.hashkey, "big");
    }

    #[tokio::test]
    async fn expired_end_time_blocks_dispatch() {
        let scheduler = Scheduler::new(SchedulePolicy::Fcfs, 1.0);
        let mut task = Task::new("late");
        task.taskid = 1;
        task.specify_end_time(1_000);
        let mut tasks = HashMap::new();
        tasks.insert(1, task);

        let mut workers = HashMap::new();
        workers.insert("w1".to_string(), worker_with(4, "w1").await);

        let placement = scheduler.select(
            &ready_of(&[&tasks[&1]]),
            &tasks,
            &workers,
            &HashMap::new(),
            &HashSet::new(),
            2_000,
        );
        assert!(placement.is_none());
    }
}
