//! Async dispatcher handle with cooperative, interruptible pacing.
//!
//! `Dispatcher` wraps a `DispatchSequencer` behind a lock and turns the
//! delay carried by each tick into a `tokio` sleep. Heartbeat and stats
//! tasks hold clones of the handle and feed topology changes in while a
//! consumer awaits `next()`; a join or leave wakes a pending sleep so the
//! rebalance tick goes out immediately.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use loadgrid_core::{Plan, UserProfile, WorkerId};

use crate::error::DispatchResult;
use crate::sequencer::{DispatchSequencer, RampPhase, Tick, TickKind};

struct State {
    sequencer: DispatchSequencer,
    /// Earliest instant the next paced tick may be emitted.
    deadline: Option<Instant>,
}

struct Shared {
    state: Mutex<State>,
    topology_changed: Notify,
}

/// Cloneable handle to a shared dispatch sequencer.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Shared>,
}

impl Dispatcher {
    pub fn new<I, S>(workers: I, profiles: Vec<UserProfile>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<WorkerId>,
    {
        Self::from_sequencer(DispatchSequencer::new(workers, profiles))
    }

    pub fn from_sequencer(sequencer: DispatchSequencer) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(State {
                    sequencer,
                    deadline: None,
                }),
                topology_changed: Notify::new(),
            }),
        }
    }

    /// Start or redirect a ramp. An in-flight pacing sleep is not
    /// interrupted; the tick emitted on wake reflects the new target.
    pub fn start_ramp(&self, target: u64, rate: f64) -> DispatchResult<()> {
        self.lock().sequencer.start_ramp(target, rate)
    }

    pub fn start_ramp_with_profiles(
        &self,
        target: u64,
        rate: f64,
        profiles: &[&str],
    ) -> DispatchResult<()> {
        self.lock()
            .sequencer
            .start_ramp_with_profiles(target, rate, profiles)
    }

    /// Wait out the pacing delay, then return the next plan.
    ///
    /// Returns `None` once the ramp is exhausted.
    pub async fn next(&self) -> Option<Plan> {
        self.next_tick().await.map(|tick| tick.plan)
    }

    /// Like `next`, but returns the full tick.
    pub async fn next_tick(&self) -> Option<Tick> {
        loop {
            let deadline = {
                let state = self.lock();
                if !state.sequencer.is_ramping() {
                    return None;
                }
                if state.sequencer.rebalance_pending() {
                    None
                } else {
                    state.deadline
                }
            };

            if let Some(deadline) = deadline.filter(|d| *d > Instant::now()) {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = self.inner.topology_changed.notified() => {
                        debug!("pacing sleep interrupted by topology change");
                        continue;
                    }
                }
            }

            return self.emit();
        }
    }

    /// Compute the next tick and arm the pacing deadline.
    fn emit(&self) -> Option<Tick> {
        let mut state = self.lock();
        let started = Instant::now();
        let tick = state.sequencer.next_tick()?;
        if tick.kind == TickKind::Step {
            // Measured from the start of computation, so compute time is
            // absorbed by the delay.
            state.deadline = (!tick.delay.is_zero()).then(|| started + tick.delay);
        }
        Some(tick)
    }

    /// Track a new worker. Returns `false` if it was already tracked.
    pub fn add_worker(&self, worker: &str) -> bool {
        let changed = self.lock().sequencer.add_worker(worker);
        if changed {
            self.inner.topology_changed.notify_one();
        }
        changed
    }

    /// Stop tracking a worker. Returns `false` if it was not tracked.
    pub fn remove_worker(&self, worker: &str) -> bool {
        let changed = self.lock().sequencer.remove_worker(worker);
        if changed {
            self.inner.topology_changed.notify_one();
        }
        changed
    }

    pub fn register_profile(&self, profile: UserProfile) {
        self.lock().sequencer.register_profile(profile);
    }

    /// Snapshot of the live plan.
    pub fn current_plan(&self) -> Plan {
        self.lock().sequencer.current_plan()
    }

    pub fn phase(&self) -> RampPhase {
        self.lock().sequencer.phase()
    }

    pub fn is_ramping(&self) -> bool {
        self.lock().sequencer.is_ramping()
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        self.lock().sequencer.workers().to_vec()
    }

    /// Run `f` against the sequencer under the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&DispatchSequencer) -> R) -> R {
        f(&self.lock().sequencer)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn equal_profiles() -> Vec<UserProfile> {
        vec![
            UserProfile::weighted("P1", 1.0),
            UserProfile::weighted("P2", 1.0),
            UserProfile::weighted("P3", 1.0),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_follows_rate() {
        let dispatcher = Dispatcher::new(["w1"], vec![UserProfile::weighted("a", 1.0)]);
        dispatcher.start_ramp(10, 2.4).unwrap();

        let mut emitted = Vec::new();
        while let Some(plan) = dispatcher.next().await {
            emitted.push((Instant::now(), plan.total()));
        }

        let totals: Vec<u64> = emitted.iter().map(|(_, t)| *t).collect();
        assert_eq!(totals, vec![2, 4, 6, 8, 10]);

        for pair in emitted.windows(2) {
            let gap = pair[1].0 - pair[0].0;
            assert!(
                (gap.as_secs_f64() - 0.833).abs() < 0.05,
                "gap between ticks was {gap:?}"
            );
        }
        assert_eq!(dispatcher.phase(), RampPhase::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_is_immediate_and_last_does_not_sleep() {
        let dispatcher = Dispatcher::new(["w1"], equal_profiles());
        dispatcher.start_ramp(3, 1.0).unwrap();

        let start = Instant::now();
        assert!(dispatcher.next().await.is_some());
        assert_eq!(start.elapsed(), Duration::ZERO);

        dispatcher.next().await.unwrap();
        dispatcher.next().await.unwrap();
        let last = Instant::now();

        assert!(dispatcher.next().await.is_none());
        assert_eq!(last.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_removal_interrupts_pacing_sleep() {
        let dispatcher = Dispatcher::new(["1", "2", "3"], equal_profiles());
        dispatcher.start_ramp(9, 0.5).unwrap();
        dispatcher.next().await.unwrap();

        let consumer = dispatcher.clone();
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let tick = consumer.next_tick().await;
            (tick, started.elapsed())
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(dispatcher.remove_worker("2"));

        let (tick, waited) = handle.await.unwrap();
        let tick = tick.unwrap();
        assert_eq!(tick.kind, TickKind::Rebalance);
        assert!(!tick.plan.contains_worker("2"));
        assert!(waited < Duration::from_secs(2), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn rebalance_keeps_step_deadline() {
        let dispatcher = Dispatcher::new(["1", "2"], equal_profiles());
        dispatcher.start_ramp(6, 1.0).unwrap();

        let start = Instant::now();
        dispatcher.next().await.unwrap();
        dispatcher.add_worker("3");

        let rebalance = dispatcher.next_tick().await.unwrap();
        assert_eq!(rebalance.kind, TickKind::Rebalance);
        assert_eq!(start.elapsed(), Duration::ZERO);

        let step = dispatcher.next_tick().await.unwrap();
        assert_eq!(step.kind, TickKind::Step);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn topology_change_after_done_surfaces_one_tick() {
        let dispatcher = Dispatcher::new(["1", "2", "3"], equal_profiles());
        dispatcher.start_ramp(9, 3.0).unwrap();
        while dispatcher.next().await.is_some() {}

        assert!(dispatcher.remove_worker("2"));
        assert!(!dispatcher.remove_worker("2"));

        let plan = dispatcher.next().await.unwrap();
        let mut totals = vec![plan.worker_total("1"), plan.worker_total("3")];
        totals.sort();
        assert_eq!(totals, vec![4, 5]);
        assert!(dispatcher.next().await.is_none());
    }

    #[tokio::test]
    async fn invalid_ramp_keeps_previous_state() {
        let dispatcher = Dispatcher::new(["1"], equal_profiles());
        assert!(dispatcher.start_ramp(3, -1.0).is_err());
        assert_eq!(dispatcher.phase(), RampPhase::Idle);
        assert!(dispatcher.next().await.is_none());
        assert_eq!(dispatcher.workers(), vec!["1".to_string()]);
        assert_eq!(dispatcher.inspect(|seq| seq.target()), 0);
    }
}
