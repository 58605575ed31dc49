//! Dispatch sequencer — drives the live plan toward the ideal plan.
//!
//! The sequencer is a synchronous state machine. `start_ramp` computes the
//! ideal plan (`weigh` then `spread`) and every `next_tick` moves the live
//! plan a bounded number of single-user steps toward it:
//!
//! ```text
//! Idle ──start_ramp──▶ Ramping ──live == ideal──▶ Done
//!                         │  ▲
//!            add/remove   ▼  │ rebalance tick (zero delay)
//!                      Rebalancing
//! ```
//!
//! Each step changes one (worker, profile) cell by one user toward its
//! ideal count. While the population is below (above) its target, steps
//! only add (remove) users: increments go to a least-loaded worker and
//! decrements come from a most-loaded one. Once the population matches,
//! the remaining differences are closed by swaps, a decrement paired with
//! an increment inside the same tick, so the emitted total never leaves
//! the range between the start and the target. Worker totals never differ
//! by more than one.
//!
//! Pacing is reported on each tick; sleeping is the caller's job (see
//! `Dispatcher`).

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use loadgrid_core::{Plan, ProfileName, UserProfile, WorkerId};

use crate::balancer::{RoundRobin, spread};
use crate::error::{DispatchError, DispatchResult};
use crate::topology::Topology;
use crate::weighting::weigh;

/// Current phase of the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampPhase {
    /// No ramp started yet.
    Idle,
    /// Stepping toward the ideal plan.
    Ramping,
    /// A topology change is waiting to be surfaced as a tick.
    Rebalancing,
    /// The live plan equals the ideal plan.
    Done,
}

/// Whether the current ramp adds or removes users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Growing,
    Shrinking,
}

/// Why a tick was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    /// A paced batch of single-user steps.
    Step,
    /// Existing users re-spread after a worker joined or left.
    Rebalance,
}

/// One emitted plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub plan: Plan,
    pub kind: TickKind,
    /// Pacing to observe before the next tick. Zero on the final tick and
    /// on rebalance ticks.
    pub delay: Duration,
    /// Individual user changes applied by this tick.
    pub changes: u64,
}

// ── Profile registry ───────────────────────────────────────────────

/// Profiles known to the dispatcher, keyed by name.
///
/// Duplicates passed at construction are kept so `start_ramp` can reject
/// them; `register` replaces by name.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: Vec<UserProfile>,
}

impl ProfileRegistry {
    pub fn new(profiles: Vec<UserProfile>) -> Self {
        Self { profiles }
    }

    /// Add a profile, or replace the one with the same name.
    ///
    /// Returns `true` if an existing descriptor was replaced.
    pub fn register(&mut self, profile: UserProfile) -> bool {
        match self.profiles.iter_mut().find(|p| p.name == profile.name) {
            Some(existing) => {
                *existing = profile;
                true
            }
            None => {
                self.profiles.push(profile);
                false
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&UserProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Distinct profile names in name order.
    pub fn names(&self) -> Vec<ProfileName> {
        let names: BTreeSet<&ProfileName> = self.profiles.iter().map(|p| &p.name).collect();
        names.into_iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    fn validate(&self) -> DispatchResult<()> {
        if self.profiles.is_empty() {
            return Err(DispatchError::NoProfiles);
        }
        let mut seen = BTreeSet::new();
        for profile in &self.profiles {
            if !seen.insert(profile.name.as_str()) {
                return Err(DispatchError::DuplicateProfile(profile.name.clone()));
            }
            if !(profile.weight.is_finite() && profile.weight > 0.0) {
                return Err(DispatchError::InvalidWeight {
                    name: profile.name.clone(),
                    weight: profile.weight,
                });
            }
        }
        Ok(())
    }

    /// Profiles active for a ramp: the named subset, or all of them.
    fn select(&self, names: Option<&[&str]>) -> DispatchResult<Vec<UserProfile>> {
        let Some(names) = names else {
            return Ok(self.profiles.clone());
        };
        let mut active = Vec::with_capacity(names.len());
        for name in names {
            let profile = self
                .get(name)
                .ok_or_else(|| DispatchError::UnknownProfile((*name).to_string()))?;
            if !active.iter().any(|p: &UserProfile| p.name == profile.name) {
                active.push(profile.clone());
            }
        }
        if active.is_empty() {
            return Err(DispatchError::NoProfiles);
        }
        Ok(active)
    }
}

// ── Ramp state ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RampState {
    target: u64,
    batch_size: u64,
    pacing: Duration,
    /// Ideal per-profile totals, with a zero entry for every registered profile.
    targets: BTreeMap<ProfileName, u64>,
    ideal: Plan,
    live: Plan,
    direction: Direction,
    /// Idle, Ramping or Done; `Rebalancing` is derived from the flag below.
    phase: RampPhase,
    rebalance_pending: bool,
    /// Next profile to visit when picking a step.
    cursor: RoundRobin,
}

/// Stateful engine that owns the live plan and paces it toward the ideal.
///
/// Single-writer: wrap it in a lock (as `Dispatcher` does) to share it.
#[derive(Debug, Clone)]
pub struct DispatchSequencer {
    registry: ProfileRegistry,
    topology: Topology,
    /// All registered profile names; every plan carries a cell for each.
    profile_names: Vec<ProfileName>,
    state: RampState,
    iteration_durations: Vec<Duration>,
}

impl DispatchSequencer {
    /// Create a sequencer seeded with the initial workers and profiles.
    ///
    /// Profiles are validated when a ramp starts, not here.
    pub fn new<I, S>(workers: I, profiles: Vec<UserProfile>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<WorkerId>,
    {
        let topology = Topology::new(workers);
        let registry = ProfileRegistry::new(profiles);
        let profile_names = registry.names();
        let live = Plan::zeroed(topology.ordered(), &profile_names);

        Self {
            state: RampState {
                target: 0,
                batch_size: 1,
                pacing: Duration::ZERO,
                targets: profile_names.iter().map(|n| (n.clone(), 0)).collect(),
                ideal: live.clone(),
                live,
                direction: Direction::Growing,
                phase: RampPhase::Idle,
                rebalance_pending: false,
                cursor: RoundRobin::new(),
            },
            registry,
            topology,
            profile_names,
            iteration_durations: Vec::new(),
        }
    }

    /// Begin (or redirect) a ramp toward `target` users at `rate` users/sec.
    pub fn start_ramp(&mut self, target: u64, rate: f64) -> DispatchResult<()> {
        self.begin(target, rate, None)
    }

    /// Like `start_ramp`, with only the named profiles active. The other
    /// registered profiles ramp down to zero.
    pub fn start_ramp_with_profiles(
        &mut self,
        target: u64,
        rate: f64,
        profiles: &[&str],
    ) -> DispatchResult<()> {
        self.begin(target, rate, Some(profiles))
    }

    fn begin(&mut self, target: u64, rate: f64, selection: Option<&[&str]>) -> DispatchResult<()> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(DispatchError::InvalidRate(rate));
        }
        self.registry.validate()?;
        let active = self.registry.select(selection)?;
        check_fixed_capacity(&active, target)?;
        if target > 0 && self.topology.is_empty() {
            return Err(DispatchError::NoWorkers { target });
        }

        let mut targets: BTreeMap<ProfileName, u64> =
            self.profile_names.iter().map(|n| (n.clone(), 0)).collect();
        targets.extend(weigh(&active, target));

        let batch_size = (rate.floor() as u64).max(1);
        let state = &mut self.state;
        state.ideal = spread(&targets, self.topology.ordered());
        state.targets = targets;
        state.target = target;
        state.batch_size = batch_size;
        state.pacing = Duration::from_secs_f64(batch_size as f64 / rate);
        state.direction = if target > state.live.total() {
            Direction::Growing
        } else {
            Direction::Shrinking
        };
        state.cursor.reset();
        state.phase = if state.live == state.ideal {
            RampPhase::Done
        } else {
            RampPhase::Ramping
        };
        self.iteration_durations.clear();

        info!(
            target,
            rate,
            batch_size,
            current = state.live.total(),
            direction = ?state.direction,
            pacing_ms = state.pacing.as_millis() as u64,
            "ramp started"
        );
        Ok(())
    }

    /// Produce the next tick, or `None` once the ramp is exhausted.
    pub fn next_tick(&mut self) -> Option<Tick> {
        let started = Instant::now();
        let tick = if self.state.rebalance_pending {
            self.state.rebalance_pending = false;
            Tick {
                plan: self.state.live.clone(),
                kind: TickKind::Rebalance,
                delay: Duration::ZERO,
                changes: 0,
            }
        } else if self.state.phase == RampPhase::Ramping {
            self.step()
        } else {
            return None;
        };
        self.iteration_durations.push(started.elapsed());
        Some(tick)
    }

    /// Track a new worker. Existing users are re-spread immediately and the
    /// result is surfaced as the next tick. Returns `false` if already tracked.
    pub fn add_worker(&mut self, worker: &str) -> bool {
        if !self.topology.join(worker) {
            return false;
        }
        self.respread();
        true
    }

    /// Stop tracking a worker. Returns `false` if it was not tracked.
    pub fn remove_worker(&mut self, worker: &str) -> bool {
        if !self.topology.leave(worker) {
            return false;
        }
        self.respread();
        true
    }

    /// Add a profile to the registry or replace the one with the same name.
    /// Takes effect at the next `start_ramp`.
    pub fn register_profile(&mut self, profile: UserProfile) {
        let name = profile.name.clone();
        let replaced = self.registry.register(profile);
        if !replaced && !self.profile_names.contains(&name) {
            self.profile_names = self.registry.names();
            for worker in self.topology.ordered() {
                self.state.live.set(worker, &name, 0);
                self.state.ideal.set(worker, &name, 0);
            }
            self.state.targets.insert(name.clone(), 0);
        }
        debug!(profile = %name, replaced, "profile registered");
    }

    /// Snapshot of the live plan.
    pub fn current_plan(&self) -> Plan {
        self.state.live.clone()
    }

    /// The plan the current ramp is heading toward.
    pub fn ideal_plan(&self) -> &Plan {
        &self.state.ideal
    }

    pub fn phase(&self) -> RampPhase {
        if self.state.rebalance_pending {
            RampPhase::Rebalancing
        } else {
            self.state.phase
        }
    }

    /// Whether another tick is available.
    pub fn is_ramping(&self) -> bool {
        self.state.rebalance_pending || self.state.phase == RampPhase::Ramping
    }

    pub fn rebalance_pending(&self) -> bool {
        self.state.rebalance_pending
    }

    pub fn direction(&self) -> Direction {
        self.state.direction
    }

    pub fn target(&self) -> u64 {
        self.state.target
    }

    pub fn batch_size(&self) -> u64 {
        self.state.batch_size
    }

    /// Nominal delay between paced ticks: `batch_size / rate` seconds.
    pub fn pacing(&self) -> Duration {
        self.state.pacing
    }

    /// Workers in dispatch order.
    pub fn workers(&self) -> &[WorkerId] {
        self.topology.ordered()
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    /// Time spent computing each tick of the current ramp.
    pub fn iteration_durations(&self) -> &[Duration] {
        &self.iteration_durations
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Re-spread the live users and the ideal plan over the current workers.
    fn respread(&mut self) {
        let workers = self.topology.ordered();
        let state = &mut self.state;

        let mut totals: BTreeMap<ProfileName, u64> =
            self.profile_names.iter().map(|n| (n.clone(), 0)).collect();
        totals.extend(state.live.profile_totals());

        if workers.is_empty() && state.live.total() > 0 {
            warn!(
                users = state.live.total(),
                "last worker left, live users can no longer be placed"
            );
        }

        state.live = spread(&totals, workers);
        state.ideal = spread(&state.targets, workers);
        state.rebalance_pending = true;
        state.direction = if state.ideal.total() > state.live.total() {
            Direction::Growing
        } else {
            Direction::Shrinking
        };
        state.phase = match state.phase {
            RampPhase::Idle if state.live == state.ideal => RampPhase::Idle,
            _ if state.live == state.ideal => RampPhase::Done,
            _ => RampPhase::Ramping,
        };

        info!(
            workers = workers.len(),
            users = state.live.total(),
            phase = ?state.phase,
            "rebalance scheduled"
        );
    }

    fn step(&mut self) -> Tick {
        let workers = self.topology.ordered();
        let state = &mut self.state;
        let remaining = remaining_changes(&state.live, &state.ideal, workers, &self.profile_names);

        let changes = if state.direction == Direction::Shrinking && remaining <= state.batch_size {
            // Tail of a ramp-down: land exactly on the ideal plan.
            state.live = state.ideal.clone();
            remaining
        } else {
            let mut loads: Vec<u64> = workers.iter().map(|w| state.live.worker_total(w)).collect();
            let ideal_loads: Vec<u64> = workers.iter().map(|w| state.ideal.worker_total(w)).collect();
            let mut applied = 0;
            while applied < state.batch_size {
                let room = state.batch_size - applied;
                let changed = apply_next(
                    state,
                    workers,
                    &self.profile_names,
                    &mut loads,
                    &ideal_loads,
                    room,
                    applied == 0,
                );
                if changed == 0 {
                    break;
                }
                applied += changed;
            }
            applied
        };

        let done = state.live == state.ideal;
        let delay = if done {
            state.phase = RampPhase::Done;
            info!(users = state.live.total(), "ramp completed");
            Duration::ZERO
        } else {
            state.pacing
        };

        debug!(
            users = state.live.total(),
            target = state.target,
            changes,
            "dispatch tick"
        );

        Tick {
            plan: state.live.clone(),
            kind: TickKind::Step,
            delay,
            changes,
        }
    }
}

/// Reject fixed-only profile sets that cannot land exactly on `target`.
fn check_fixed_capacity(active: &[UserProfile], target: u64) -> DispatchResult<()> {
    match active {
        [UserProfile { name, fixed_count: Some(fixed_count), .. }] if *fixed_count > target => {
            return Err(DispatchError::FixedCountExceedsTarget {
                name: name.clone(),
                fixed_count: *fixed_count,
                target,
            });
        }
        _ => {}
    }
    if active.iter().all(UserProfile::is_fixed) {
        let capacity = active
            .iter()
            .filter_map(|p| p.fixed_count)
            .fold(0u64, u64::saturating_add);
        if target > capacity {
            return Err(DispatchError::FixedCapacityExceeded { target, capacity });
        }
    }
    Ok(())
}

/// Single-user changes still needed to turn `live` into `ideal`.
fn remaining_changes(live: &Plan, ideal: &Plan, workers: &[WorkerId], profiles: &[ProfileName]) -> u64 {
    workers
        .iter()
        .flat_map(|w| profiles.iter().map(move |p| (w, p)))
        .map(|(w, p)| live.get(w, p).abs_diff(ideal.get(w, p)))
        .sum()
}

#[derive(Debug, Clone, Copy)]
enum Move {
    Increment,
    Decrement,
}

/// Apply the next change toward the ideal plan and return how many
/// single-user changes it made (0 when the tick should end).
///
/// Below the target population only increments are taken, above it only
/// decrements. At the target a swap is taken: two changes that leave the
/// total untouched. A swap needs two units of `room`, except as the first
/// change of a tick so a batch of one still makes progress.
fn apply_next(
    state: &mut RampState,
    workers: &[WorkerId],
    profiles: &[ProfileName],
    loads: &mut [u64],
    ideal_loads: &[u64],
    room: u64,
    fresh: bool,
) -> u64 {
    let min = loads.iter().copied().min().unwrap_or(0);
    let max = loads.iter().copied().max().unwrap_or(0);
    let live_total: u64 = loads.iter().sum();
    let ideal_total: u64 = ideal_loads.iter().sum();

    match live_total.cmp(&ideal_total) {
        Ordering::Less => {
            if let Some((w, p)) = find_move(state, workers, profiles, Move::Increment, |w| loads[w] == min) {
                commit(state, &workers[w], &profiles[p], Move::Increment, &mut loads[w]);
                return 1;
            }
        }
        Ordering::Greater => {
            if let Some((w, p)) = find_move(state, workers, profiles, Move::Decrement, |w| loads[w] == max) {
                commit(state, &workers[w], &profiles[p], Move::Decrement, &mut loads[w]);
                return 1;
            }
        }
        Ordering::Equal => {
            if room < 2 && !fresh {
                return 0;
            }
            if swap(state, workers, profiles, loads, ideal_loads) {
                return 2;
            }
        }
    }

    // Only reachable from an unbalanced live plan; converge regardless.
    for (w, worker) in workers.iter().enumerate() {
        for profile in profiles {
            let (have, want) = (state.live.get(worker, profile), state.ideal.get(worker, profile));
            if have != want {
                let mv = if have < want { Move::Increment } else { Move::Decrement };
                commit(state, worker, profile, mv, &mut loads[w]);
                return 1;
            }
        }
    }
    0
}

/// Move one user between cells at a constant population.
///
/// The user leaves a worker holding more than its ideal total (any worker
/// when every total already matches) and joins a worker holding less, which
/// after the decrement includes the same worker. Both plans are balanced,
/// so the worker totals stay within one of each other.
fn swap(
    state: &mut RampState,
    workers: &[WorkerId],
    profiles: &[ProfileName],
    loads: &mut [u64],
    ideal_loads: &[u64],
) -> bool {
    let over = |w: usize| loads[w] > ideal_loads[w];
    let from = if (0..workers.len()).any(over) {
        find_move(state, workers, profiles, Move::Decrement, over)
    } else {
        find_move(state, workers, profiles, Move::Decrement, |_| true)
    };
    let Some((w, p)) = from else {
        return false;
    };
    commit(state, &workers[w], &profiles[p], Move::Decrement, &mut loads[w]);

    match find_move(state, workers, profiles, Move::Increment, |w| loads[w] < ideal_loads[w]) {
        Some((w, p)) => {
            commit(state, &workers[w], &profiles[p], Move::Increment, &mut loads[w]);
            true
        }
        None => {
            // Undo; the caller falls back to single changes.
            commit(state, &workers[w], &profiles[p], Move::Increment, &mut loads[w]);
            false
        }
    }
}

/// Find a (worker, profile) cell for `mv` on an `eligible` worker,
/// visiting profiles from the cursor.
///
/// Increments take the first eligible worker in dispatch order, decrements
/// the last.
fn find_move(
    state: &mut RampState,
    workers: &[WorkerId],
    profiles: &[ProfileName],
    mv: Move,
    eligible: impl Fn(usize) -> bool,
) -> Option<(usize, usize)> {
    let n = profiles.len();
    let start = state.cursor.peek(n)?;

    for offset in 0..n {
        let p = (start + offset) % n;
        let profile = &profiles[p];
        let found = match mv {
            Move::Increment => workers.iter().enumerate().position(|(w, worker)| {
                eligible(w) && state.live.get(worker, profile) < state.ideal.get(worker, profile)
            }),
            Move::Decrement => workers.iter().enumerate().rposition(|(w, worker)| {
                eligible(w) && state.live.get(worker, profile) > state.ideal.get(worker, profile)
            }),
        };
        if let Some(w) = found {
            state.cursor.advance(offset + 1, n);
            return Some((w, p));
        }
    }
    None
}

fn commit(state: &mut RampState, worker: &str, profile: &str, mv: Move, load: &mut u64) {
    let current = state.live.get(worker, profile);
    match mv {
        Move::Increment => {
            state.live.set(worker, profile, current + 1);
            *load += 1;
        }
        Move::Decrement => {
            state.live.set(worker, profile, current - 1);
            *load -= 1;
        }
    }
}
