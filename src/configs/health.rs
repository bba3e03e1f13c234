use serde::{Deserialize, Serialize};

use crate::video::constants::{
    DEFAULT_RESET_STORM_THRESHOLD, DEFAULT_RESET_STORM_WINDOW_MS, DEFAULT_STATS_INTERVAL,
    DEFAULT_TARGET_FPS,
};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HealthConfig {
    /// Accepted packets between two performance reports.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_packets: u64,
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    /// Ring backlog that triggers a warning. Defaults to the initial ring
    /// capacity.
    #[serde(default)]
    pub high_water_bytes: Option<usize>,
    #[serde(default = "default_reset_storm_threshold")]
    pub reset_storm_threshold: u32,
    #[serde(default = "default_reset_storm_window_ms")]
    pub reset_storm_window_ms: u64,
}

fn default_stats_interval() -> u64 {
    DEFAULT_STATS_INTERVAL
}

fn default_target_fps() -> u32 {
    DEFAULT_TARGET_FPS
}

fn default_reset_storm_threshold() -> u32 {
    DEFAULT_RESET_STORM_THRESHOLD
}

fn default_reset_storm_window_ms() -> u64 {
    DEFAULT_RESET_STORM_WINDOW_MS
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stats_interval_packets: default_stats_interval(),
            target_fps: default_target_fps(),
            high_water_bytes: None,
            reset_storm_threshold: default_reset_storm_threshold(),
            reset_storm_window_ms: default_reset_storm_window_ms(),
        }
    }
}
