//! Domain types shared by the dispatcher and its collaborators.
//!
//! A `Plan` is what the master hands to the transport layer after every
//! tick. All types serialize to/from JSON so a plan can be diffed and
//! shipped to workers without further conversion.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque worker identifier supplied by the caller (e.g. `host_instance`).
pub type WorkerId = String;

/// Unique name of a user profile.
pub type ProfileName = String;

// ── UserProfile ────────────────────────────────────────────────────

/// A named virtual-user type.
///
/// Profiles with a `fixed_count` are excluded from weight-based
/// apportionment and always receive their exact count first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub name: ProfileName,
    /// Relative proportion among non-fixed profiles.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Exact number of users, ignoring weight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_count: Option<u64>,
}

fn default_weight() -> f64 {
    1.0
}

impl UserProfile {
    /// A weight-apportioned profile.
    pub fn weighted(name: &str, weight: f64) -> Self {
        Self {
            name: name.to_string(),
            weight,
            fixed_count: None,
        }
    }

    /// A profile that always runs exactly `count` users.
    pub fn fixed(name: &str, count: u64) -> Self {
        Self {
            name: name.to_string(),
            weight: default_weight(),
            fixed_count: Some(count),
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed_count.is_some()
    }
}

// ── Plan ───────────────────────────────────────────────────────────

/// Cumulative snapshot of how many users of each profile should run on
/// each worker: `worker → (profile → count)`.
///
/// A plan is not a delta. Workers and profiles that are present but idle
/// carry explicit zero entries, so two plans over the same topology and
/// profile set compare equal exactly when every count matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan(BTreeMap<WorkerId, BTreeMap<ProfileName, u64>>);

impl Plan {
    /// A plan with a zero entry for every worker × profile pair.
    pub fn zeroed<W, P>(workers: &[W], profiles: &[P]) -> Self
    where
        W: AsRef<str>,
        P: AsRef<str>,
    {
        let row: BTreeMap<ProfileName, u64> = profiles
            .iter()
            .map(|p| (p.as_ref().to_string(), 0))
            .collect();
        Self(
            workers
                .iter()
                .map(|w| (w.as_ref().to_string(), row.clone()))
                .collect(),
        )
    }

    /// Count of `profile` users on `worker` (0 when absent).
    pub fn get(&self, worker: &str, profile: &str) -> u64 {
        self.0
            .get(worker)
            .and_then(|row| row.get(profile))
            .copied()
            .unwrap_or(0)
    }

    /// Set the count of `profile` users on `worker`, creating entries as needed.
    pub fn set(&mut self, worker: &str, profile: &str, count: u64) {
        self.0
            .entry(worker.to_string())
            .or_default()
            .insert(profile.to_string(), count);
    }

    /// Total users across all workers and profiles.
    pub fn total(&self) -> u64 {
        self.0.values().flat_map(|row| row.values()).sum()
    }

    /// Total users assigned to one worker.
    pub fn worker_total(&self, worker: &str) -> u64 {
        self.0.get(worker).map_or(0, |row| row.values().sum())
    }

    /// Total users of one profile across all workers.
    pub fn profile_total(&self, profile: &str) -> u64 {
        self.0.values().filter_map(|row| row.get(profile)).sum()
    }

    /// Per-profile totals across all workers.
    pub fn profile_totals(&self) -> BTreeMap<ProfileName, u64> {
        let mut totals = BTreeMap::new();
        for row in self.0.values() {
            for (profile, count) in row {
                *totals.entry(profile.clone()).or_insert(0) += count;
            }
        }
        totals
    }

    /// Difference between the busiest and the least busy worker.
    pub fn spread(&self) -> u64 {
        let totals = self.0.values().map(|row| row.values().sum::<u64>());
        let (min, max) = totals.fold((u64::MAX, 0), |(lo, hi), t| (lo.min(t), hi.max(t)));
        max.saturating_sub(min)
    }

    /// Worker ids present in the plan, in id order.
    pub fn workers(&self) -> impl Iterator<Item = &WorkerId> {
        self.0.keys()
    }

    /// Per-profile counts for one worker.
    pub fn worker(&self, worker: &str) -> Option<&BTreeMap<ProfileName, u64>> {
        self.0.get(worker)
    }

    pub fn contains_worker(&self, worker: &str) -> bool {
        self.0.contains_key(worker)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&WorkerId, &BTreeMap<ProfileName, u64>)> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_plan_has_every_cell() {
        let plan = Plan::zeroed(&["w1", "w2"], &["a", "b"]);
        assert_eq!(plan.total(), 0);
        assert_eq!(plan.worker("w2").unwrap().len(), 2);
        assert_eq!(plan.spread(), 0);
    }

    #[test]
    fn totals_and_spread() {
        let mut plan = Plan::zeroed(&["w1", "w2", "w3"], &["a", "b"]);
        plan.set("w1", "a", 2);
        plan.set("w1", "b", 1);
        plan.set("w2", "a", 1);

        assert_eq!(plan.total(), 4);
        assert_eq!(plan.worker_total("w1"), 3);
        assert_eq!(plan.profile_total("a"), 3);
        assert_eq!(plan.profile_totals().get("b"), Some(&1));
        assert_eq!(plan.spread(), 3);
        assert_eq!(plan.get("w9", "a"), 0);
    }

    #[test]
    fn plan_serializes_as_nested_map() {
        let mut plan = Plan::zeroed(&["w1"], &["a"]);
        plan.set("w1", "a", 5);
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json, serde_json::json!({ "w1": { "a": 5 } }));
    }

    #[test]
    fn profile_weight_defaults_to_one() {
        let profile: UserProfile = serde_json::from_str(r#"{ "name": "browse" }"#).unwrap();
        assert_eq!(profile.weight, 1.0);
        assert!(!profile.is_fixed());
        assert!(UserProfile::fixed("admin", 2).is_fixed());
    }
}
