//! Scenario file (`loadgrid.toml`) parser.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::{ProfileName, UserProfile, WorkerId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub dispatch: DispatchConfig,
    pub profiles: Vec<UserProfile>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub events: Vec<TopologyEventConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Initial worker set.
    #[serde(default)]
    pub workers: Vec<WorkerId>,
}

/// One ramp: drive the population to `target` at `rate` users per second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub target: u64,
    pub rate: f64,
    /// Profiles active for this stage. All registered profiles when absent.
    pub profiles: Option<Vec<ProfileName>>,
}

/// A worker joining or leaving after a given number of emitted ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyEventConfig {
    pub after_tick: u64,
    pub join: Option<WorkerId>,
    pub leave: Option<WorkerId>,
}

impl ScenarioConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ScenarioConfig = toml::from_str(content)?;
        for event in &config.events {
            if event.join.is_some() == event.leave.is_some() {
                anyhow::bail!(
                    "event after tick {} must set exactly one of `join` or `leave`",
                    event.after_tick
                );
            }
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
