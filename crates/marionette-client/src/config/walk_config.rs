use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Defaults for the walk coordinator; scripts may override most per call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkConfig {
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default = "default_waypoint_timeout")]
    pub waypoint_timeout_ms: u64,
    #[serde(default = "default_proximity")]
    pub proximity: f64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Lower bound of the resend cadence, which is otherwise a third of the timeout
    #[serde(default = "default_resend_floor")]
    pub resend_floor_ms: u64,
    /// How long a periodic condition must wait after a walk before starting another
    #[serde(default = "default_periodic_cooldown")]
    pub periodic_cooldown_ms: u64,
    #[serde(default = "default_map_change_stride")]
    pub map_change_stride: usize,
    #[serde(default = "default_map_change_timeout")]
    pub map_change_timeout_ms: u64,
}

fn default_stride() -> usize {
    4
}

fn default_waypoint_timeout() -> u64 {
    3000
}

fn default_proximity() -> f64 {
    2.0
}

fn default_poll_interval() -> u64 {
    50
}

fn default_resend_floor() -> u64 {
    500
}

fn default_periodic_cooldown() -> u64 {
    10_000
}

fn default_map_change_stride() -> usize {
    3
}

fn default_map_change_timeout() -> u64 {
    10_000
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            stride: default_stride(),
            waypoint_timeout_ms: default_waypoint_timeout(),
            proximity: default_proximity(),
            poll_interval_ms: default_poll_interval(),
            resend_floor_ms: default_resend_floor(),
            periodic_cooldown_ms: default_periodic_cooldown(),
            map_change_stride: default_map_change_stride(),
            map_change_timeout_ms: default_map_change_timeout(),
        }
    }
}

impl WalkConfig {
    pub fn waypoint_timeout(&self) -> Duration {
        Duration::from_millis(self.waypoint_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Resend cadence for a waypoint with the given timeout
    pub fn resend_interval(&self, timeout: Duration) -> Duration {
        (timeout / 3).max(Duration::from_millis(self.resend_floor_ms))
    }

    pub fn periodic_cooldown(&self) -> Duration {
        Duration::from_millis(self.periodic_cooldown_ms)
    }

    pub fn map_change_timeout(&self) -> Duration {
        Duration::from_millis(self.map_change_timeout_ms)
    }
}
