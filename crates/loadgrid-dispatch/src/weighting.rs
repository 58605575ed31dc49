//! Profile weighting — how many users of each profile a population holds.
//!
//! Fixed-count profiles are served first. Weighted profiles split what is
//! left in proportion to their weights:
//!
//! ```text
//! share(p) = max(1, round(weight(p) / Σweights × remaining))
//! ```
//!
//! Rounding drift is corrected by trying every way of adding or removing
//! the missing units (combinations with replacement) and keeping the one
//! whose achieved ratios sit closest to the declared ones. Running time
//! depends on the number of profiles only, never on the population size.

use std::collections::BTreeMap;

use loadgrid_core::{ProfileName, UserProfile};

/// Above this many candidate adjustments the drift is applied greedily.
const MAX_DRIFT_COMBINATIONS: u128 = 1000;

/// Compute the ideal number of users per profile for `target` users.
///
/// Profiles are expected to be validated (unique names, positive
/// weights). The result holds an entry for every profile.
///
/// When `target` covers every fixed count, each fixed profile gets exactly
/// its count and weighted profiles split the remainder. Otherwise the
/// target is divided among the fixed profiles in proportion to their
/// counts and weighted profiles get nothing. When no weighted profile
/// exists the users beyond the fixed counts have nowhere to go, so the
/// sum can fall short of `target`; the dispatcher rejects that case.
pub fn weigh(profiles: &[UserProfile], target: u64) -> BTreeMap<ProfileName, u64> {
    let mut sorted: Vec<&UserProfile> = profiles.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut counts: BTreeMap<ProfileName, u64> =
        sorted.iter().map(|p| (p.name.clone(), 0)).collect();

    let fixed: Vec<(&str, u64)> = sorted
        .iter()
        .filter_map(|p| p.fixed_count.map(|c| (p.name.as_str(), c)))
        .collect();
    let fixed_total = fixed.iter().fold(0u64, |acc, (_, c)| acc.saturating_add(*c));

    let remaining = if fixed_total <= target {
        for (name, count) in &fixed {
            counts.insert((*name).to_string(), *count);
        }
        target - fixed_total
    } else {
        for ((name, _), share) in fixed.iter().zip(apportion_capped(&fixed, target)) {
            counts.insert((*name).to_string(), share);
        }
        0
    };

    let weighted: Vec<(&str, f64)> = sorted
        .iter()
        .filter(|p| !p.is_fixed())
        .map(|p| (p.name.as_str(), p.weight))
        .collect();
    for ((name, _), share) in weighted.iter().zip(apportion(&weighted, remaining)) {
        counts.insert((*name).to_string(), share);
    }

    counts
}

/// Split `amount` across name-sorted `(name, weight)` entries.
fn apportion(entries: &[(&str, f64)], amount: u64) -> Vec<u64> {
    let mut shares = vec![0u64; entries.len()];
    if entries.is_empty() || amount == 0 {
        return shares;
    }

    // At most one user each, heaviest profiles first.
    if amount <= entries.len() as u64 {
        for idx in by_weight_desc(entries).into_iter().take(amount as usize) {
            shares[idx] = 1;
        }
        return shares;
    }

    let total_weight: f64 = entries.iter().map(|(_, w)| w).sum();
    for (share, (_, weight)) in shares.iter_mut().zip(entries) {
        *share = ((weight / total_weight) * amount as f64).round().max(1.0) as u64;
    }

    if shares.iter().sum::<u64>() != amount {
        correct_drift(entries, amount, total_weight, &mut shares);
    }
    shares
}

/// Like `apportion`, with each entry's weight doubling as its cap.
fn apportion_capped(entries: &[(&str, u64)], amount: u64) -> Vec<u64> {
    let mut shares = vec![0u64; entries.len()];
    let positive: Vec<usize> = (0..entries.len()).filter(|&i| entries[i].1 > 0).collect();
    let weighted: Vec<(&str, f64)> = positive
        .iter()
        .map(|&i| (entries[i].0, entries[i].1 as f64))
        .collect();
    for (&idx, share) in positive.iter().zip(apportion(&weighted, amount)) {
        shares[idx] = share;
    }

    let mut excess = 0;
    for (share, (_, cap)) in shares.iter_mut().zip(entries) {
        if *share > *cap {
            excess += *share - *cap;
            *share = *cap;
        }
    }

    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| entries[b].1.cmp(&entries[a].1));
    for idx in order {
        if excess == 0 {
            break;
        }
        let room = (entries[idx].1 - shares[idx]).min(excess);
        shares[idx] += room;
        excess -= room;
    }
    shares
}

/// Bring `shares` to sum exactly `amount`, keeping every share ≥ 1.
fn correct_drift(entries: &[(&str, f64)], amount: u64, total_weight: f64, shares: &mut [u64]) {
    let drift = amount as i128 - shares.iter().sum::<u64>() as i128;
    let grow = drift > 0;
    let units = drift.unsigned_abs() as usize;

    if combinations_with_replacement(entries.len(), units) <= MAX_DRIFT_COMBINATIONS {
        let mut best: Option<(f64, Vec<u64>)> = None;
        for combination in Multisets::new(entries.len(), units) {
            let mut candidate = shares.to_vec();
            if !adjust(&mut candidate, &combination, grow) {
                continue;
            }
            let distance = distance_from_weights(entries, &candidate, amount, total_weight);
            // Strictly smaller only: the first candidate in name order wins ties.
            if best.as_ref().is_none_or(|(d, _)| distance < *d) {
                best = Some((distance, candidate));
            }
        }
        if let Some((_, candidate)) = best {
            shares.copy_from_slice(&candidate);
            return;
        }
    }

    let order = by_weight_desc(entries);
    let mut left = units;
    while left > 0 {
        let before = left;
        for &idx in &order {
            if left == 0 {
                break;
            }
            if grow {
                shares[idx] += 1;
                left -= 1;
            } else if shares[idx] > 1 {
                shares[idx] -= 1;
                left -= 1;
            }
        }
        if left == before {
            break;
        }
    }
}

/// Apply one unit per index in `combination`. Fails if a share would drop below 1.
fn adjust(shares: &mut [u64], combination: &[usize], grow: bool) -> bool {
    for &idx in combination {
        if grow {
            shares[idx] += 1;
        } else if shares[idx] <= 1 {
            return false;
        } else {
            shares[idx] -= 1;
        }
    }
    true
}

/// Euclidean distance between achieved and declared ratios.
fn distance_from_weights(entries: &[(&str, f64)], shares: &[u64], amount: u64, total_weight: f64) -> f64 {
    entries
        .iter()
        .zip(shares)
        .map(|((_, weight), &share)| {
            let diff = share as f64 / amount as f64 - weight / total_weight;
            diff * diff
        })
        .sum::<f64>()
        .sqrt()
}

/// Entry indices ordered by weight descending, then name ascending.
fn by_weight_desc(entries: &[(&str, f64)]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    // Stable sort keeps the name order among equal weights.
    order.sort_by(|&a, &b| entries[b].1.total_cmp(&entries[a].1));
    order
}

/// C(n + k - 1, k), saturating just above the search threshold.
fn combinations_with_replacement(n: usize, k: usize) -> u128 {
    if n == 0 {
        return 0;
    }
    let mut result: u128 = 1;
    for i in 1..=k as u128 {
        result = result * (n as u128 - 1 + i) / i;
        if result > MAX_DRIFT_COMBINATIONS {
            return MAX_DRIFT_COMBINATIONS + 1;
        }
    }
    result
}

/// Non-decreasing index sequences of length `k` over `0..n`, in
/// lexicographic order.
struct Multisets {
    n: usize,
    current: Option<Vec<usize>>,
}

impl Multisets {
    fn new(n: usize, k: usize) -> Self {
        Self {
            n,
            current: (n > 0).then(|| vec![0; k]),
        }
    }
}

impl Iterator for Multisets {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let current = self.current.take()?;
        let mut successor = current.clone();
        if let Some(pos) = successor.iter().rposition(|&idx| idx + 1 < self.n) {
            let value = successor[pos] + 1;
            for slot in &mut successor[pos..] {
                *slot = value;
            }
            self.current = Some(successor);
        }
        Some(current)
    }
}
