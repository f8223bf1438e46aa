//! Resource vectors shared by tasks, workers, and categories.
//!
//! A [`Resources`] value describes cores, memory (MB), disk (MB), and gpus.
//! Fields use `-1` to mean "unset", matching the wire protocol where workers
//! report totals as plain integers and tasks may leave any subset of their
//! request unspecified. All arithmetic helpers treat unset fields explicitly
//! rather than as zero, so the distinction survives merging and accounting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for an unspecified resource field.
pub const UNSET: i64 = -1;

/// A vector of schedulable resources.
///
/// Used in three roles: a worker's advertised totals, the committed sum of
/// in-flight allocations on a worker, and a task's requested / allocated /
/// measured triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Number of processor cores.
    pub cores: i64,
    /// Memory in megabytes.
    pub memory: i64,
    /// Disk space in megabytes.
    pub disk: i64,
    /// Number of GPU devices.
    pub gpus: i64,
}

impl Default for Resources {
    fn default() -> Self {
        Self::unset()
    }
}

impl Resources {
    /// A vector with every field unset.
    pub fn unset() -> Self {
        Resources {
            cores: UNSET,
            memory: UNSET,
            disk: UNSET,
            gpus: UNSET,
        }
    }

    /// A vector with every field zero.
    pub fn zero() -> Self {
        Resources {
            cores: 0,
            memory: 0,
            disk: 0,
            gpus: 0,
        }
    }

    /// Create a fully specified vector.
    pub fn new(cores: i64, memory: i64, disk: i64, gpus: i64) -> Self {
        Resources {
            cores,
            memory,
            disk,
            gpus,
        }
    }

    /// True if no field has been specified.
    pub fn is_unset(&self) -> bool {
        self.cores < 0 && self.memory < 0 && self.disk < 0 && self.gpus < 0
    }

    /// Field-name/value pairs, in protocol order.
    pub fn fields(&self) -> [(&'static str, i64); 4] {
        [
            ("cores", self.cores),
            ("memory", self.memory),
            ("disk", self.disk),
            ("gpus", self.gpus),
        ]
    }

    /// Take each field from `self` where set, falling back to `defaults`.
    pub fn or(&self, defaults: &Resources) -> Resources {
        fn pick(a: i64, b: i64) -> i64 {
            if a >= 0 { a } else { b }
        }
        Resources {
            cores: pick(self.cores, defaults.cores),
            memory: pick(self.memory, defaults.memory),
            disk: pick(self.disk, defaults.disk),
            gpus: pick(self.gpus, defaults.gpus),
        }
    }

    /// Element-wise maximum, ignoring unset fields on either side.
    pub fn widen(&self, other: &Resources) -> Resources {
        fn wide(a: i64, b: i64) -> i64 {
            match (a >= 0, b >= 0) {
                (true, true) => a.max(b),
                (true, false) => a,
                (false, true) => b,
                (false, false) => UNSET,
            }
        }
        Resources {
            cores: wide(self.cores, other.cores),
            memory: wide(self.memory, other.memory),
            disk: wide(self.disk, other.disk),
            gpus: wide(self.gpus, other.gpus),
        }
    }

    /// True if every set field of `self` fits within `avail`.
    ///
    /// Unset fields in the request are treated as zero demand; callers are
    /// expected to have resolved an effective allocation first.
    pub fn fits_in(&self, avail: &Resources) -> bool {
        fn fit(want: i64, have: i64) -> bool {
            want <= 0 || have >= want
        }
        fit(self.cores, avail.cores)
            && fit(self.memory, avail.memory)
            && fit(self.disk, avail.disk)
            && fit(self.gpus, avail.gpus)
    }

    /// Add another vector into this one, treating unset fields as zero.
    pub fn accumulate(&mut self, other: &Resources) {
        fn add(a: i64, b: i64) -> i64 {
            a.max(0) + b.max(0)
        }
        self.cores = add(self.cores, other.cores);
        self.memory = add(self.memory, other.memory);
        self.disk = add(self.disk, other.disk);
        self.gpus = add(self.gpus, other.gpus);
    }

    /// Subtract a previously accumulated vector, clamping at zero.
    pub fn release(&mut self, other: &Resources) {
        fn sub(a: i64, b: i64) -> i64 {
            (a.max(0) - b.max(0)).max(0)
        }
        self.cores = sub(self.cores, other.cores);
        self.memory = sub(self.memory, other.memory);
        self.disk = sub(self.disk, other.disk);
        self.gpus = sub(self.gpus, other.gpus);
    }

    /// Remaining capacity after subtracting `committed` from `self`,
    /// optionally scaled by an overcommit multiplier.
    pub fn available(&self, committed: &Resources, multiplier: f64) -> Resources {
        fn avail(total: i64, used: i64, m: f64) -> i64 {
            if total < 0 {
                return 0;
            }
            ((total as f64 * m) as i64 - used.max(0)).max(0)
        }
        Resources {
            cores: avail(self.cores, committed.cores, multiplier),
            memory: avail(self.memory, committed.memory, multiplier),
            disk: avail(self.disk, committed.disk, multiplier),
            gpus: avail(self.gpus, committed.gpus, multiplier),
        }
    }

    /// Sum of set fields weighted equally, used to rank workers by slack.
    pub fn slack_score(&self) -> i64 {
        self.cores.max(0) + self.memory.max(0) / 1024 + self.disk.max(0) / 1024 + self.gpus.max(0)
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show(v: i64) -> String {
            if v < 0 {
                "~".to_string()
            } else {
                v.to_string()
            }
        }
        write!(
            f,
            "cores {} memory {} MB disk {} MB gpus {}",
            show(self.cores),
            show(self.memory),
            show(self.disk),
            show(self.gpus)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_by_default() {
        let r = Resources::default();
        assert!(r.is_unset());
        assert_eq!(r.cores, UNSET);
    }

    #[test]
    fn or_fills_only_unset_fields() {
        let requested = Resources {
            cores: 2,
            ..Resources::unset()
        };
        let defaults = Resources::new(1, 512, 1024, 0);
        let merged = requested.or(&defaults);
        assert_eq!(merged.cores, 2);
        assert_eq!(merged.memory, 512);
        assert_eq!(merged.disk, 1024);
        assert_eq!(merged.gpus, 0);
    }

    #[test]
    fn widen_takes_element_maximum() {
        let a = Resources::new(1, 4096, UNSET, 0);
        let b = Resources::new(4, 1024, 100, UNSET);
        let w = a.widen(&b);
        assert_eq!(w, Resources::new(4, 4096, 100, 0));
    }

    #[test]
    fn fits_ignores_unset_requests() {
        let want = Resources {
            cores: 2,
            ..Resources::unset()
        };
        let have = Resources::new(2, 1000, 1000, 0);
        assert!(want.fits_in(&have));
        let too_small = Resources::new(1, 1000, 1000, 0);
        assert!(!want.fits_in(&too_small));
    }

    #[test]
    fn accumulate_and_release_round_trip() {
        let mut committed = Resources::zero();
        let alloc = Resources::new(2, 512, 100, 0);
        committed.accumulate(&alloc);
        assert_eq!(committed.cores, 2);
        committed.release(&alloc);
        assert_eq!(committed, Resources::zero());
    }

    #[test]
    fn available_applies_multiplier() {
        let total = Resources::new(4, 1000, 1000, 1);
        let committed = Resources::new(4, 0, 0, 0);
        let free = total.available(&committed, 2.0);
        assert_eq!(free.cores, 4);
        let free = total.available(&committed, 1.0);
        assert_eq!(free.cores, 0);
    }
}
