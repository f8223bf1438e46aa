//! Categories: per-label resource policy and execution statistics.
//!
//! Tasks carrying the same category label are expected to have similar
//! resource use. A [`Category`] aggregates completed-task measurements in a
//! rolling sample and, when autolabeling is enabled, derives the
//! first-allocation guess used for the FIRST attempt of each task. The MAX
//! bucket falls back to the category's hard bounds. Categories also hold the
//! mean-runtime accumulator consulted by the fast-abort policy and the TIME
//! scheduling policy.

use super::resources::Resources;
use super::task::AllocationBucket;
use std::collections::VecDeque;

/// How per-task allocations are derived within a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    /// Tasks run with exactly their requested values; exhaustion is permanent.
    Fixed,
    /// First attempts use the maximum values observed so far; exhaustion
    /// retries at the declared maximum.
    Max,
    /// As `Max`, but the first-allocation guess minimizes waste.
    MinWaste,
    /// As `Max`, but the first-allocation guess maximizes throughput.
    MaxThroughput,
}

/// Per-resource enable bits for autolabeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutolabelBits {
    /// Learn a cores guess.
    pub cores: bool,
    /// Learn a memory guess.
    pub memory: bool,
    /// Learn a disk guess.
    pub disk: bool,
    /// Learn a gpus guess.
    pub gpus: bool,
}

impl AutolabelBits {
    /// All resources enabled.
    pub fn all() -> Self {
        AutolabelBits {
            cores: true,
            memory: true,
            disk: true,
            gpus: true,
        }
    }

    /// All resources disabled.
    pub fn none() -> Self {
        AutolabelBits {
            cores: false,
            memory: false,
            disk: false,
            gpus: false,
        }
    }
}

/// One completed-task measurement retained in the rolling sample.
#[derive(Debug, Clone, Copy)]
struct Sample {
    measured: Resources,
    wall_time_us: u64,
}

/// Number of completed-task measurements retained per category.
const SAMPLE_WINDOW: usize = 64;

/// Allocation for a task with nothing specified anywhere: one core, no other
/// demand.
const DEFAULT_ALLOCATION: Resources = Resources {
    cores: 1,
    memory: 0,
    disk: 0,
    gpus: 0,
};

/// Per-label resource policy and aggregated statistics.
#[derive(Debug)]
pub struct Category {
    /// Category label.
    pub name: String,
    /// Allocation derivation mode.
    pub mode: AllocationMode,
    /// Hard per-task upper bounds (MAX bucket).
    pub max_allocation: Resources,
    /// Per-task lower bounds; every effective allocation is widened by these.
    pub min_allocation: Resources,
    /// Current first-allocation guess. User-settable; autolabel overwrites
    /// enabled fields as measurements accumulate.
    pub first_allocation: Resources,
    /// Which resources autolabel may learn.
    pub autolabel: AutolabelBits,
    /// Fast-abort multiplier override; `None` defers to the global setting.
    pub fast_abort_multiplier: Option<f64>,

    /// Tasks submitted under this label.
    pub tasks_submitted: u64,
    /// Tasks completed and returned.
    pub tasks_done: u64,
    /// Tasks returned with a failure code.
    pub tasks_failed: u64,
    /// Attempts that ended in resource exhaustion.
    pub tasks_exhausted_attempts: u64,

    total_execute_time_us: u64,
    finished_count: u64,
    samples: VecDeque<Sample>,
}

impl Category {
    /// Create an empty category with `Fixed` allocation.
    pub fn new(name: &str) -> Self {
        Category {
            name: name.to_string(),
            mode: AllocationMode::Fixed,
            max_allocation: Resources::unset(),
            min_allocation: Resources::unset(),
            first_allocation: Resources::unset(),
            autolabel: AutolabelBits::none(),
            fast_abort_multiplier: None,
            tasks_submitted: 0,
            tasks_done: 0,
            tasks_failed: 0,
            tasks_exhausted_attempts: 0,
            total_execute_time_us: 0,
            finished_count: 0,
            samples: VecDeque::new(),
        }
    }

    /// Record a completed attempt's measurements.
    ///
    /// Feeds both the fast-abort mean and, when autolabeling, the
    /// first-allocation guess. Returns true if the guess changed, so the
    /// caller can log the transition.
    pub fn accumulate_measurement(&mut self, measured: Resources, wall_time_us: u64) -> bool {
        self.total_execute_time_us += wall_time_us;
        self.finished_count += 1;

        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            measured,
            wall_time_us,
        });

        if self.mode == AllocationMode::Fixed {
            return false;
        }
        let previous = self.first_allocation;
        self.update_first_allocation();
        previous != self.first_allocation
    }

    /// Mean execution time of completed tasks, microseconds.
    pub fn average_task_time(&self) -> Option<u64> {
        if self.finished_count == 0 {
            None
        } else {
            Some(self.total_execute_time_us / self.finished_count)
        }
    }

    /// Runtime above which an in-flight task is fast-aborted, given the
    /// effective multiplier. `None` until enough history exists.
    pub fn fast_abort_limit(&self, default_multiplier: f64) -> Option<u64> {
        let multiplier = self.fast_abort_multiplier.unwrap_or(default_multiplier);
        if multiplier <= 0.0 {
            return None;
        }
        self.average_task_time()
            .map(|mean| (mean as f64 * multiplier) as u64)
    }

    /// Compute the effective per-attempt allocation for a task of this
    /// category.
    ///
    /// FIRST attempts take user-requested values where set, then the
    /// first-allocation guess, then the category max; MAX attempts skip the
    /// guess. The result is widened by the category minimum and defaults to a
    /// single core when nothing is specified anywhere. The FIRST allocation
    /// never exceeds the MAX allocation for the same request.
    pub fn effective_allocation(
        &self,
        requested: &Resources,
        bucket: AllocationBucket,
    ) -> Resources {
        let merged = match bucket {
            AllocationBucket::First => requested
                .or(&self.first_allocation)
                .or(&self.max_allocation),
            AllocationBucket::Max => requested.or(&self.max_allocation),
        };
        let mut effective = merged.widen(&self.min_allocation).or(&DEFAULT_ALLOCATION);

        // Clamp the guess so FIRST never exceeds what MAX would grant.
        if bucket == AllocationBucket::First {
            let ceiling = self.effective_allocation(requested, AllocationBucket::Max);
            fn clamp(value: i64, ceiling: i64) -> i64 {
                if ceiling >= 0 && value > ceiling {
                    ceiling
                } else {
                    value
                }
            }
            effective.cores = clamp(effective.cores, ceiling.cores);
            effective.memory = clamp(effective.memory, ceiling.memory);
            effective.disk = clamp(effective.disk, ceiling.disk);
            effective.gpus = clamp(effective.gpus, ceiling.gpus);
        }
        effective
    }

    fn update_first_allocation(&mut self) {
        fn field_values(samples: &VecDeque<Sample>, pick: fn(&Resources) -> i64) -> Vec<i64> {
            samples
                .iter()
                .map(|s| pick(&s.measured))
                .filter(|v| *v >= 0)
                .collect()
        }

        let mode = self.mode;
        let mut derive = |enabled: bool, pick: fn(&Resources) -> i64| -> Option<i64> {
            if !enabled {
                return None;
            }
            let mut values = field_values(&self.samples, pick);
            if values.is_empty() {
                return None;
            }
            values.sort_unstable();
            Some(match mode {
                AllocationMode::Fixed => return None,
                AllocationMode::Max => *values.last()?,
                // Waste shrinks with a tighter guess; throughput favors the
                // typical case and accepts more exhaustion retries.
                AllocationMode::MinWaste => values[(values.len() * 3) / 4],
                AllocationMode::MaxThroughput => {
                    let sum: i64 = values.iter().sum();
                    let len = values.len() as i64;
                    (sum + len - 1) / len
                }
            })
        };

        if let Some(v) = derive(self.autolabel.cores, |r| r.cores) {
            self.first_allocation.cores = v;
        }
        if let Some(v) = derive(self.autolabel.memory, |r| r.memory) {
            self.first_allocation.memory = v;
        }
        if let Some(v) = derive(self.autolabel.disk, |r| r.disk) {
            self.first_allocation.disk = v;
        }
        if let Some(v) = derive(self.autolabel.gpus, |r| r.gpus) {
            self.first_allocation.gpus = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn fixed_mode_uses_requested_then_defaults() {
        let c = Category::new("default");
        let requested = Resources {
            cores: 2,
            ..Resources::unset()
        };
        let alloc = c.effective_allocation(&requested, AllocationBucket::First);
        assert_eq!(alloc.cores, 2);
        assert_eq!(alloc.memory, 0);
    }

    #[test]
    fn default_allocation_is_one_core() {
        let c = Category::new("default");
        let alloc = c.effective_allocation(&Resources::unset(), AllocationBucket::First);
        assert_eq!(alloc, Resources::new(1, 0, 0, 0));
    }

    #[test]
    fn max_bucket_takes_category_bounds() {
        let mut c = Category::new("sim");
        c.max_allocation = Resources::new(8, 16000, 0, 0);
        let alloc = c.effective_allocation(&Resources::unset(), AllocationBucket::Max);
        assert_eq!(alloc.cores, 8);
        assert_eq!(alloc.memory, 16000);
    }

    #[test]
    fn first_widens_monotonically_to_max() {
        let mut c = Category::new("sim");
        c.mode = AllocationMode::Max;
        c.autolabel = AutolabelBits::all();
        c.max_allocation = Resources::new(8, 16000, 0, 0);
        c.first_allocation = Resources::new(2, 4000, 0, 0);

        let requested = Resources::unset();
        let first = c.effective_allocation(&requested, AllocationBucket::First);
        let max = c.effective_allocation(&requested, AllocationBucket::Max);
        assert!(first.fits_in(&max));
    }

    #[test]
    fn first_guess_clamped_by_max() {
        let mut c = Category::new("sim");
        c.max_allocation = Resources::new(4, 0, 0, 0);
        c.first_allocation = Resources::new(16, 0, 0, 0);
        let alloc = c.effective_allocation(&Resources::unset(), AllocationBucket::First);
        assert_eq!(alloc.cores, 4);
    }

    #[rstest]
    #[case(AllocationMode::Max, 4000)]
    #[case(AllocationMode::MaxThroughput, 2500)]
    fn autolabel_learns_per_mode(#[case] mode: AllocationMode, #[case] expected_memory: i64) {
        let mut c = Category::new("learn");
        c.mode = mode;
        c.autolabel = AutolabelBits::all();
        c.accumulate_measurement(Resources::new(1, 1000, 0, 0), 1_000_000);
        c.accumulate_measurement(Resources::new(1, 4000, 0, 0), 1_000_000);
        assert_eq!(c.first_allocation.memory, expected_memory);
    }

    #[test]
    fn fast_abort_limit_needs_history_and_multiplier() {
        let mut c = Category::new("default");
        assert_eq!(c.fast_abort_limit(3.0), None);
        c.accumulate_measurement(Resources::unset(), 2_000_000);
        assert_eq!(c.fast_abort_limit(3.0), Some(6_000_000));
        assert_eq!(c.fast_abort_limit(0.0), None);
        c.fast_abort_multiplier = Some(2.0);
        assert_eq!(c.fast_abort_limit(3.0), Some(4_000_000));
    }

    #[test]
    fn sample_window_is_bounded() {
        let mut c = Category::new("bounded");
        c.mode = AllocationMode::Max;
        c.autolabel = AutolabelBits::all();
        for i in 0..(SAMPLE_WINDOW + 10) {
            c.accumulate_measurement(Resources::new(1, i as i64, 0, 0), 1000);
        }
        assert_eq!(c.samples.len(), SAMPLE_WINDOW);
    }
}
