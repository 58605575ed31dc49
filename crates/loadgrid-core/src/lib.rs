pub mod config;
pub mod types;

pub use config::ScenarioConfig;
pub use types::*;
