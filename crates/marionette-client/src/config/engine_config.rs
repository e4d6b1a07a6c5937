use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cadence of the periodic supervisor pass (default: 100ms)
    #[serde(default = "default_supervisor_tick")]
    pub supervisor_tick_ms: u64,

    /// Fraction of a periodic condition's `interval` slept between runs
    #[serde(default = "default_interval_scale")]
    pub periodic_interval_scale: f64,

    /// Worker count of the blocking-operation pool
    #[serde(default = "default_blocking_workers")]
    pub blocking_workers: usize,

    /// Worker count of the pathfinding pool
    #[serde(default = "default_path_workers")]
    pub path_workers: usize,

    /// Interval given to periodic conditions that do not set one
    #[serde(default = "default_interval")]
    pub default_interval: f64,
}

fn default_supervisor_tick() -> u64 {
    100
}

fn default_interval_scale() -> f64 {
    0.02
}

fn default_blocking_workers() -> usize {
    4
}

fn default_path_workers() -> usize {
    1
}

fn default_interval() -> f64 {
    1.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            supervisor_tick_ms: default_supervisor_tick(),
            periodic_interval_scale: default_interval_scale(),
            blocking_workers: default_blocking_workers(),
            path_workers: default_path_workers(),
            default_interval: default_interval(),
        }
    }
}

impl EngineConfig {
    pub fn supervisor_tick(&self) -> Duration {
        Duration::from_millis(self.supervisor_tick_ms.max(1))
    }

    /// Pause between two runs of a periodic condition with `interval`
    pub fn periodic_pause(&self, interval: f64) -> Duration {
        Duration::try_from_secs_f64((interval * self.periodic_interval_scale).max(0.0))
            .unwrap_or(Duration::MAX)
    }
}
