//! # Settings Module
//!
//! Named key/value configuration, read once at startup. Components copy the
//! values they need at construction time; rules receive explicit parameter
//! structs built from these values rather than consulting a global, so each
//! rule is independently testable.

use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

/// Server world-simulation settings with their default values.
///
/// Field names follow the configuration keys of the original server family,
/// so existing operator muscle memory transfers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Radius, in blocks, around each player within which blocks are active.
    pub active_block_range: i16,
    /// Seconds between recomputations of the active block set.
    pub active_block_mgmt_interval: f32,
    /// Seconds between ABM passes over the active blocks.
    pub abm_interval: f32,
    /// Soft time budget of one ABM pass, seconds.
    pub abm_time_budget: f32,
    /// Seconds between save sweeps of modified blocks.
    pub server_map_save_interval: f32,
    /// Seconds an unreferenced block stays loaded before eviction.
    pub server_unload_unused_data_timeout: f32,
    /// Maximum queued liquid nodes processed per liquid step.
    pub liquid_loop_max: usize,
    /// Seconds between liquid steps.
    pub liquid_update: f32,
    /// Registration limit of active objects per block-sized volume; used to
    /// damp runaway spawners.
    pub max_objects_per_block: u16,
    /// Master switch for the tree/leaves growth rules.
    pub grow_tree: bool,
    /// Forces every growth chance to certainty and shrinks intervals, for
    /// deterministic testing.
    pub grow_debug_fast: bool,
    /// World generation seed.
    pub mapgen_seed: u32,
    /// Sea level in node coordinates; generated air below this becomes water.
    pub water_level: i16,
    /// Number of emerge worker threads.
    pub emerge_threads: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            active_block_range: 2,
            active_block_mgmt_interval: 2.0,
            abm_interval: 1.0,
            abm_time_budget: 0.2,
            server_map_save_interval: 5.3,
            server_unload_unused_data_timeout: 29.0,
            liquid_loop_max: 100_000,
            liquid_update: 1.0,
            max_objects_per_block: 256,
            grow_tree: true,
            grow_debug_fast: false,
            mapgen_seed: 0,
            water_level: 1,
            emerge_threads: 1,
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file. Missing keys fall back to their
    /// defaults; a missing file is an error so typos in the path do not
    /// silently run a default world.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&text)
            .with_context(|| format!("parsing settings file {}", path.display()))?;
        info!("loaded settings from {}", path.display());
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let s = Settings::default();
        assert_eq!(s.active_block_range, 2);
        assert_eq!(s.abm_interval, 1.0);
        assert_eq!(s.server_unload_unused_data_timeout, 29.0);
        assert_eq!(s.liquid_loop_max, 100_000);
        assert!(s.grow_tree);
        assert!(!s.grow_debug_fast);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let s: Settings = serde_json::from_str(r#"{"active_block_range": 4}"#).unwrap();
        assert_eq!(s.active_block_range, 4);
        assert_eq!(s.abm_interval, 1.0);
    }

    #[test]
    fn settings_round_trip_through_json() {
        let mut s = Settings::default();
        s.grow_debug_fast = true;
        s.mapgen_seed = 1234;
        let text = serde_json::to_string(&s).unwrap();
        let restored: Settings = serde_json::from_str(&text).unwrap();
        assert!(restored.grow_debug_fast);
        assert_eq!(restored.mapgen_seed, 1234);
    }
}
