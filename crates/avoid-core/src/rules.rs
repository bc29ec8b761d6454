//! Avoidance rules and thresholds.

use crate::error::{DeconflictError, Result};
use crate::models::Millis;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// How the engine decides that a feed delivered new data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeMarker {
    /// Compare the handoff's per-source generation counters
    #[default]
    Generation,
    /// Compare the raw feed timestamps; only valid if the feed guarantees
    /// the value changes exactly when a new message arrives
    Timestamp,
}

/// Configuration for conflict prediction and zone handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvoidanceRules {
    /// Zones and remainders shorter than this are discarded
    pub min_zone_duration_ms: Millis,
    /// Maximum propagation depth away from the own vehicle per tick
    pub recursion_cap: usize,
    /// Maximum merge/clip passes when flattening one timeline
    pub merge_pass_cap: usize,
    /// Prediction horizon from the current tick
    pub lookahead_ms: Millis,
    /// Sampling step for trajectory extrapolation
    pub sample_step_ms: Millis,
    /// Minimum horizontal separation in meters
    pub separation_horizontal_m: f64,
    /// Minimum vertical separation in meters
    pub separation_vertical_m: f64,
    /// Traffic older than this is not re-predicted
    pub stale_after_ms: Millis,
    /// Height of one deconfliction layer
    pub layer_spacing_m: f64,
    /// Altitude of layer 0
    pub base_altitude_m: f64,
    pub change_marker: ChangeMarker,
}

impl Default for AvoidanceRules {
    fn default() -> Self {
        Self {
            min_zone_duration_ms: 250,
            recursion_cap: 4,
            merge_pass_cap: 1024,
            lookahead_ms: 20_000,
            sample_step_ms: 100,
            separation_horizontal_m: 50.0,
            separation_vertical_m: 30.0,
            stale_after_ms: 5_000,
            layer_spacing_m: 15.0,
            base_altitude_m: 30.0,
            change_marker: ChangeMarker::Generation,
        }
    }
}

impl AvoidanceRules {
    /// Load rules from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let rules: Self = serde_json::from_str(&raw)?;
        rules.validate()?;
        Ok(rules)
    }

    /// Defaults overridden by `AVOID_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_zone_duration_ms: env_or("AVOID_MIN_ZONE_MS", defaults.min_zone_duration_ms),
            recursion_cap: env_or("AVOID_RECURSION_CAP", defaults.recursion_cap),
            merge_pass_cap: env_or("AVOID_MERGE_PASS_CAP", defaults.merge_pass_cap),
            lookahead_ms: env_or("AVOID_LOOKAHEAD_MS", defaults.lookahead_ms),
            sample_step_ms: env_or("AVOID_SAMPLE_STEP_MS", defaults.sample_step_ms),
            separation_horizontal_m: env_or("AVOID_SEPARATION_H_M", defaults.separation_horizontal_m),
            separation_vertical_m: env_or("AVOID_SEPARATION_V_M", defaults.separation_vertical_m),
            stale_after_ms: env_or("AVOID_STALE_AFTER_MS", defaults.stale_after_ms),
            layer_spacing_m: env_or("AVOID_LAYER_SPACING_M", defaults.layer_spacing_m),
            base_altitude_m: env_or("AVOID_BASE_ALTITUDE_M", defaults.base_altitude_m),
            change_marker: match env::var("AVOID_CHANGE_MARKER").as_deref() {
                Ok("timestamp") => ChangeMarker::Timestamp,
                _ => defaults.change_marker,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_zone_duration_ms == 0 {
            return Err(DeconflictError::InvalidRules("min_zone_duration_ms must be positive".into()));
        }
        if self.sample_step_ms == 0 {
            return Err(DeconflictError::InvalidRules("sample_step_ms must be positive".into()));
        }
        if self.merge_pass_cap == 0 {
            return Err(DeconflictError::InvalidRules("merge_pass_cap must be positive".into()));
        }
        if !(self.separation_horizontal_m > 0.0 && self.separation_vertical_m > 0.0) {
            return Err(DeconflictError::InvalidRules("separations must be positive".into()));
        }
        if !(self.layer_spacing_m > 0.0) || !self.base_altitude_m.is_finite() {
            return Err(DeconflictError::InvalidRules("layer geometry must be finite and positive".into()));
        }
        Ok(())
    }

    /// Nominal altitude of a deconfliction layer.
    pub fn layer_altitude_m(&self, layer: usize) -> f64 {
        self.base_altitude_m + layer as f64 * self.layer_spacing_m
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
