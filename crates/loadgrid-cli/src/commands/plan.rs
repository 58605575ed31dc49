use std::collections::VecDeque;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};

use loadgrid_core::config::{StageConfig, TopologyEventConfig};
use loadgrid_core::{Plan, ScenarioConfig};
use loadgrid_dispatch::{DispatchResult, DispatchSequencer, Dispatcher, Tick, TickKind};

/// One emitted tick, as printed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickRecord {
    pub stage: usize,
    pub tick: u64,
    pub kind: &'static str,
    pub total: u64,
    pub delay_ms: u64,
    pub plan: Plan,
}

impl TickRecord {
    fn new(stage: usize, tick: u64, source: &Tick) -> Self {
        Self {
            stage,
            tick,
            kind: match source.kind {
                TickKind::Step => "step",
                TickKind::Rebalance => "rebalance",
            },
            total: source.plan.total(),
            delay_ms: source.delay.as_millis() as u64,
            plan: source.plan.clone(),
        }
    }
}

pub async fn run(path: &Path, format: &str, realtime: bool) -> anyhow::Result<()> {
    let config = ScenarioConfig::from_file(path)
        .with_context(|| format!("failed to load scenario {}", path.display()))?;
    info!(
        path = %path.display(),
        workers = config.dispatch.workers.len(),
        profiles = config.profiles.len(),
        stages = config.stages.len(),
        realtime,
        "scenario loaded"
    );

    let mut out = Output::new(format);
    let workers = config.dispatch.workers.clone();
    let profiles = config.profiles.clone();
    if realtime {
        drive(Dispatcher::new(workers, profiles), &config, &mut out).await?;
    } else {
        drive(DispatchSequencer::new(workers, profiles), &config, &mut out).await?;
    }
    out.finish()
}

/// Something a scenario can be played against.
trait Driver {
    fn start(&mut self, stage: &StageConfig) -> DispatchResult<()>;
    async fn next_tick(&mut self) -> Option<Tick>;
    fn add_worker(&mut self, worker: &str) -> bool;
    fn remove_worker(&mut self, worker: &str) -> bool;
}

fn stage_profiles(stage: &StageConfig) -> Option<Vec<&str>> {
    stage
        .profiles
        .as_ref()
        .map(|names| names.iter().map(String::as_str).collect())
}

/// Steps the sequencer directly; pacing is reported but not slept.
impl Driver for DispatchSequencer {
    fn start(&mut self, stage: &StageConfig) -> DispatchResult<()> {
        match stage_profiles(stage) {
            Some(names) => self.start_ramp_with_profiles(stage.target, stage.rate, &names),
            None => self.start_ramp(stage.target, stage.rate),
        }
    }

    async fn next_tick(&mut self) -> Option<Tick> {
        DispatchSequencer::next_tick(self)
    }

    fn add_worker(&mut self, worker: &str) -> bool {
        DispatchSequencer::add_worker(self, worker)
    }

    fn remove_worker(&mut self, worker: &str) -> bool {
        DispatchSequencer::remove_worker(self, worker)
    }
}

/// Awaits the paced dispatcher, sleeping between ticks.
impl Driver for Dispatcher {
    fn start(&mut self, stage: &StageConfig) -> DispatchResult<()> {
        match stage_profiles(stage) {
            Some(names) => self.start_ramp_with_profiles(stage.target, stage.rate, &names),
            None => self.start_ramp(stage.target, stage.rate),
        }
    }

    async fn next_tick(&mut self) -> Option<Tick> {
        Dispatcher::next_tick(self).await
    }

    fn add_worker(&mut self, worker: &str) -> bool {
        Dispatcher::add_worker(self, worker)
    }

    fn remove_worker(&mut self, worker: &str) -> bool {
        Dispatcher::remove_worker(self, worker)
    }
}

async fn drive<D: Driver>(mut driver: D, config: &ScenarioConfig, out: &mut Output) -> anyhow::Result<()> {
    let mut events = EventQueue::new(&config.events);
    let mut emitted = 0u64;
    events.fire(emitted, &mut driver);

    for (index, stage) in config.stages.iter().enumerate() {
        let number = index + 1;
        driver.start(stage).with_context(|| {
            format!(
                "stage {number} rejected (target {}, rate {})",
                stage.target, stage.rate
            )
        })?;

        while let Some(tick) = driver.next_tick().await {
            emitted += 1;
            out.push(TickRecord::new(number, emitted, &tick))?;
            events.fire(emitted, &mut driver);
        }
        info!(stage = number, target = stage.target, ticks = emitted, "stage finished");
    }

    if !events.is_empty() {
        warn!(
            pending = events.len(),
            ticks = emitted,
            "scenario ended before every topology event fired"
        );
    }
    Ok(())
}

/// Topology events ordered by the tick they follow.
struct EventQueue {
    pending: VecDeque<TopologyEventConfig>,
}

impl EventQueue {
    fn new(events: &[TopologyEventConfig]) -> Self {
        let mut sorted = events.to_vec();
        sorted.sort_by_key(|e| e.after_tick);
        Self {
            pending: sorted.into(),
        }
    }

    /// Apply every event due once `emitted` ticks have gone out.
    fn fire<D: Driver>(&mut self, emitted: u64, driver: &mut D) {
        while self.pending.front().is_some_and(|e| e.after_tick <= emitted) {
            let Some(event) = self.pending.pop_front() else {
                break;
            };
            if let Some(worker) = &event.join {
                driver.add_worker(worker);
            }
            if let Some(worker) = &event.leave {
                driver.remove_worker(worker);
            }
        }
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Collects tick records; text mode prints them as they arrive.
struct Output {
    json: bool,
    records: Vec<TickRecord>,
}

impl Output {
    fn new(format: &str) -> Self {
        Self {
            json: format == "json",
            records: Vec::new(),
        }
    }

    fn push(&mut self, record: TickRecord) -> anyhow::Result<()> {
        if !self.json {
            println!("{}", format_record(&record)?);
        }
        self.records.push(record);
        Ok(())
    }

    fn finish(self) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(&self.records)?);
        } else if let Some(last) = self.records.last() {
            println!("final plan ({} users):", last.total);
            println!("{}", serde_json::to_string_pretty(&last.plan)?);
        }
        Ok(())
    }
}

fn format_record(record: &TickRecord) -> anyhow::Result<String> {
    Ok(format!(
        "stage {} tick {:>4}  {:<9} total={:<6} delay={:>5}ms  {}",
        record.stage,
        record.tick,
        record.kind,
        record.total,
        record.delay_ms,
        serde_json::to_string(&record.plan)?
    ))
}
