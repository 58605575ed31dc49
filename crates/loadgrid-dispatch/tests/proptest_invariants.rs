//! Property tests for ramp invariants across random profiles, workers and rates.

use loadgrid_core::{Plan, UserProfile};
use loadgrid_dispatch::{DispatchSequencer, TickKind, spread, weigh};
use proptest::prelude::*;

const MAX_TICKS: usize = 100_000;

fn weighted_profiles() -> impl Strategy<Value = Vec<UserProfile>> {
    prop::collection::btree_map("[a-z]{1,6}", 0.1f64..10.0, 1..6).prop_map(|map| {
        map.into_iter()
            .map(|(name, weight)| UserProfile::weighted(&name, weight))
            .collect()
    })
}

/// Fixed-count profiles (`fixed0`, `fixed1`, ...) followed by weighted ones.
fn mixed_profiles() -> impl Strategy<Value = Vec<UserProfile>> {
    (prop::collection::vec(0u64..20, 1..4), weighted_profiles()).prop_map(|(fixed, weighted)| {
        fixed
            .iter()
            .enumerate()
            .map(|(i, count)| UserProfile::fixed(&format!("fixed{i}"), *count))
            .chain(weighted)
            .collect()
    })
}

fn workers() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[a-c]_[0-3]", 1..7).prop_map(|set| set.into_iter().collect())
}

/// Drain every tick and return the final plan.
///
/// Every tick must be balanced and keep its total between the population
/// at the start of the drain and the ramp target. Every step must move
/// each cell toward the ideal plan, never past it.
fn drain_checked(seq: &mut DispatchSequencer) -> Result<Plan, TestCaseError> {
    let start = seq.current_plan().total();
    let target = seq.target();
    let (low, high) = (start.min(target), start.max(target));

    let mut previous = seq.current_plan();
    let mut ticks = 0;
    while let Some(tick) = seq.next_tick() {
        let total = tick.plan.total();
        prop_assert!(tick.plan.spread() <= 1, "unbalanced tick: {:?}", tick.plan);
        prop_assert!(
            (low..=high).contains(&total),
            "total {} outside {}..={} (start {}, target {})",
            total,
            low,
            high,
            start,
            target
        );

        if tick.kind == TickKind::Step {
            let ideal = seq.ideal_plan();
            for (worker, row) in tick.plan.iter() {
                for (profile, &now) in row {
                    let before = previous.get(worker, profile);
                    let want = ideal.get(worker, profile);
                    let toward = (before <= now && now <= want) || (want <= now && now <= before);
                    prop_assert!(
                        toward,
                        "{}/{} moved {} -> {} with ideal {}",
                        worker,
                        profile,
                        before,
                        now,
                        want
                    );
                }
            }
        }

        previous = tick.plan;
        ticks += 1;
        prop_assert!(ticks < MAX_TICKS, "ramp did not converge");
    }
    Ok(seq.current_plan())
}

proptest! {
    #[test]
    fn weighted_apportionment_hits_target(
        profiles in weighted_profiles(),
        target in 0u64..100_000,
    ) {
        let counts = weigh(&profiles, target);
        prop_assert_eq!(counts.values().sum::<u64>(), target);
        if target >= profiles.len() as u64 {
            prop_assert!(counts.values().all(|c| *c >= 1));
        }
    }

    #[test]
    fn fixed_profiles_get_exact_counts(
        fixed in prop::collection::vec(0u64..50, 1..4),
        weighted in weighted_profiles(),
        extra in 0u64..500,
    ) {
        let mut profiles: Vec<UserProfile> = fixed
            .iter()
            .enumerate()
            .map(|(i, count)| UserProfile::fixed(&format!("fixed{i}"), *count))
            .collect();
        profiles.extend(weighted);
        let target = fixed.iter().sum::<u64>() + extra;

        let counts = weigh(&profiles, target);
        for (i, count) in fixed.iter().enumerate() {
            prop_assert_eq!(counts[&format!("fixed{i}")], *count);
        }
        prop_assert_eq!(counts.values().sum::<u64>(), target);
    }

    #[test]
    fn ramp_lands_on_target_with_balanced_ticks(
        profiles in weighted_profiles(),
        workers in workers(),
        first in 0u64..300,
        second in 0u64..300,
        rate in 0.5f64..25.0,
    ) {
        let mut seq = DispatchSequencer::new(workers.clone(), profiles.clone());

        for target in [first, second] {
            seq.start_ramp(target, rate).unwrap();
            let plan = drain_checked(&mut seq)?;
            prop_assert_eq!(plan.total(), target);
            prop_assert_eq!(&plan, &spread(&weigh(&profiles, target), seq.workers()));
        }
    }

    #[test]
    fn same_target_is_idempotent(
        profiles in weighted_profiles(),
        workers in workers(),
        target in 0u64..200,
    ) {
        let mut seq = DispatchSequencer::new(workers, profiles);
        seq.start_ramp(target, 50.0).unwrap();
        drain_checked(&mut seq)?;

        seq.start_ramp(target, 3.0).unwrap();
        prop_assert!(seq.next_tick().is_none());
    }

    #[test]
    fn ramp_up_and_back_restores_plan(
        profiles in weighted_profiles(),
        workers in workers(),
        base in 0u64..100,
        peak in 100u64..400,
        rate in 1.0f64..40.0,
    ) {
        let mut seq = DispatchSequencer::new(workers, profiles);
        seq.start_ramp(base, rate).unwrap();
        let original = drain_checked(&mut seq)?;

        seq.start_ramp(peak, rate).unwrap();
        drain_checked(&mut seq)?;
        seq.start_ramp(base, rate).unwrap();
        let restored = drain_checked(&mut seq)?;

        prop_assert_eq!(restored, original);
    }

    #[test]
    fn rebalance_keeps_users_and_balance(
        profiles in weighted_profiles(),
        workers in workers(),
        target in 1u64..200,
        removed in any::<prop::sample::Index>(),
    ) {
        let mut seq = DispatchSequencer::new(workers.clone(), profiles);
        seq.start_ramp(target, 10.0).unwrap();
        drain_checked(&mut seq)?;

        let gone = removed.get(&workers);
        seq.remove_worker(gone);
        seq.add_worker("z_9");

        let plan = drain_checked(&mut seq)?;
        prop_assert!(!plan.contains_worker(gone));
        prop_assert_eq!(plan.total(), target);
    }

    #[test]
    fn mixed_fixed_and_weighted_ramp(
        profiles in mixed_profiles(),
        workers in workers(),
        first in 0u64..200,
        second in 0u64..200,
        rate in 0.5f64..25.0,
    ) {
        let mut seq = DispatchSequencer::new(workers, profiles.clone());
        let fixed_total: u64 = profiles.iter().filter_map(|p| p.fixed_count).sum();

        for target in [first, second] {
            seq.start_ramp(target, rate).unwrap();
            let plan = drain_checked(&mut seq)?;
            prop_assert_eq!(plan.total(), target);
            prop_assert_eq!(&plan, &spread(&weigh(&profiles, target), seq.workers()));
            if target >= fixed_total {
                for profile in profiles.iter().filter(|p| p.is_fixed()) {
                    prop_assert_eq!(Some(plan.profile_total(&profile.name)), profile.fixed_count);
                }
            }
        }
    }

    #[test]
    fn profile_subset_ramp_stays_in_range(
        profiles in weighted_profiles(),
        workers in workers(),
        first in 0u64..200,
        second in 0u64..200,
        mask in prop::collection::vec(any::<bool>(), 6),
        rate in 0.5f64..25.0,
    ) {
        let names: Vec<&str> = profiles.iter().map(|p| p.name.as_str()).collect();
        let mut selected: Vec<&str> = names
            .iter()
            .zip(&mask)
            .filter_map(|(name, keep)| keep.then_some(*name))
            .collect();
        if selected.is_empty() {
            selected.push(names[0]);
        }

        let mut seq = DispatchSequencer::new(workers, profiles.clone());
        seq.start_ramp(first, rate).unwrap();
        drain_checked(&mut seq)?;

        seq.start_ramp_with_profiles(second, rate, &selected).unwrap();
        let plan = drain_checked(&mut seq)?;
        prop_assert_eq!(plan.total(), second);

        let active: Vec<UserProfile> = profiles
            .iter()
            .filter(|p| selected.contains(&p.name.as_str()))
            .cloned()
            .collect();
        let totals = plan.profile_totals();
        for (name, count) in weigh(&active, second) {
            prop_assert_eq!(totals[&name], count);
        }
        for profile in profiles.iter().filter(|p| !selected.contains(&p.name.as_str())) {
            prop_assert_eq!(totals[&profile.name], 0);
        }
    }
}
