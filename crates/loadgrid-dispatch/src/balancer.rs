//! Worker balancing — spread per-profile totals across workers.
//!
//! Profiles are visited in name order. Each profile's users are dealt out
//! round-robin over the workers in dispatch order, and the cursor carries
//! over from one profile to the next. Both each profile's split and every
//! worker's total therefore stay within one user of each other.

use std::collections::BTreeMap;

use loadgrid_core::{Plan, ProfileName, WorkerId};

/// A modulo-indexed cursor over a fixed-size ring.
///
/// The dispatcher is single-writer, so unlike a request-path balancer
/// this needs no atomics; it is plain state carried in the ramp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundRobin {
    position: usize,
}

impl RoundRobin {
    /// Create a cursor at index zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the next index, wrapping around `count`.
    ///
    /// Returns `None` if count is zero.
    pub fn next(&mut self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let idx = self.position % count;
        self.position = idx + 1;
        Some(idx)
    }

    /// Move the cursor forward by `steps` without selecting.
    pub fn advance(&mut self, steps: usize, count: usize) {
        if count > 0 {
            self.position = (self.position % count + steps % count) % count;
        }
    }

    /// Index the next call to `next(count)` will return.
    pub fn peek(&self, count: usize) -> Option<usize> {
        (count > 0).then(|| self.position % count)
    }

    /// Reset the cursor to zero.
    pub fn reset(&mut self) {
        self.position = 0;
    }
}

/// Spread per-profile totals across `workers` (already in dispatch order).
///
/// The plan has a zero entry for every worker × profile in `counts`.
/// With no workers the plan is empty and the counts are dropped.
pub fn spread(counts: &BTreeMap<ProfileName, u64>, workers: &[WorkerId]) -> Plan {
    let profiles: Vec<&ProfileName> = counts.keys().collect();
    let mut plan = Plan::zeroed(workers, &profiles);
    let n = workers.len();
    if n == 0 {
        return plan;
    }

    let mut cursor = RoundRobin::new();
    for (profile, &count) in counts {
        let base = count / n as u64;
        let extra = (count % n as u64) as usize;
        if base > 0 {
            for worker in workers {
                plan.set(worker, profile, base);
            }
        }
        for _ in 0..extra {
            if let Some(idx) = cursor.next(n) {
                plan.set(&workers[idx], profile, base + 1);
            }
        }
    }
    plan
}
