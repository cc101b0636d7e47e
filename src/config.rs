//! Runtime configuration
//!
//! All knobs are supplied at startup and stay immutable for the lifetime of a
//! run. Every section has sensible defaults so a partial JSON document is a
//! valid configuration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::FusionError;
use crate::types::{GeoPoint, Modality};

/// Upper bound for every duration knob given in seconds (one year)
pub const MAX_DURATION_SECS: i64 = 365 * 24 * 3_600;

/// What to do with evidence that arrives after its window closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatePolicy {
    /// Discard and count
    #[default]
    Drop,
    /// Re-fuse the closed window and emit a correction
    Reopen,
}

impl std::str::FromStr for LatePolicy {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(LatePolicy::Drop),
            "reopen" => Ok(LatePolicy::Reopen),
            other => Err(FusionError::InvalidConfig(format!(
                "unknown late policy '{other}' (expected drop or reopen)"
            ))),
        }
    }
}

/// Log-distance path loss model mapping received strength to range
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathLossModel {
    /// Expected received strength at 1 meter (dBm)
    pub reference_dbm: f64,
    /// Path loss exponent (2 = free space, 3-4 = urban)
    pub exponent: f64,
    /// Smallest accuracy radius ever reported (meters)
    pub min_radius_m: f64,
    /// Radius used when strength is missing, and the upper clamp (meters)
    pub max_radius_m: f64,
}

impl PathLossModel {
    fn cellular() -> Self {
        Self {
            reference_dbm: -30.0,
            exponent: 3.5,
            min_radius_m: 150.0,
            max_radius_m: 5_000.0,
        }
    }

    fn wifi() -> Self {
        Self {
            reference_dbm: -40.0,
            exponent: 3.0,
            min_radius_m: 5.0,
            max_radius_m: 150.0,
        }
    }
}

impl Default for PathLossModel {
    fn default() -> Self {
        Self::cellular()
    }
}

/// Axis-aligned geographic bounding box
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.lat_min && lat <= self.lat_max && lon >= self.lon_min && lon <= self.lon_max
    }
}

/// Signal normalizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// How far in the future a timestamp may be before it is rejected (seconds)
    pub clock_skew_tolerance_secs: i64,
    /// Accuracy assumed for GPS fixes that omit one (meters)
    pub default_gps_accuracy_m: f64,
    pub cdr: PathLossModel,
    pub probe: PathLossModel,
    /// Known cell towers and probe sensors by identifier
    pub anchors: HashMap<String, GeoPoint>,
    /// Evidence outside this box is rejected
    pub service_area: Option<BoundingBox>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            clock_skew_tolerance_secs: 30,
            default_gps_accuracy_m: 20.0,
            cdr: PathLossModel::cellular(),
            probe: PathLossModel::wifi(),
            anchors: HashMap::new(),
            service_area: None,
        }
    }
}

/// How long an entity's last sighting stays eligible for matching, per modality
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessBounds {
    pub gps_secs: i64,
    pub cdr_secs: i64,
    pub probe_secs: i64,
}

impl Default for StalenessBounds {
    fn default() -> Self {
        Self {
            gps_secs: 30,
            cdr_secs: 600,
            probe_secs: 300,
        }
    }
}

impl StalenessBounds {
    pub fn for_modality(&self, modality: Modality) -> Duration {
        let secs = match modality {
            Modality::Gps => self.gps_secs,
            Modality::Cdr => self.cdr_secs,
            Modality::Probe => self.probe_secs,
        };
        Duration::seconds(secs)
    }
}

/// Entity matching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Candidates scoring above this are rejected
    pub acceptance_threshold: f64,
    pub spatial_weight: f64,
    pub temporal_weight: f64,
    /// Plausible subject speed used to widen the spatial gate over time (m/s)
    pub max_speed_mps: f64,
    /// Score multiplier for a candidate already bound to the same source (0-1)
    pub same_source_affinity: f64,
    /// Spatial index cell size (degrees)
    pub grid_cell_deg: f64,
    pub staleness: StalenessBounds,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 3.0,
            spatial_weight: 1.0,
            temporal_weight: 1.0,
            max_speed_mps: 15.0,
            same_source_affinity: 0.5,
            grid_cell_deg: 0.01,
            staleness: StalenessBounds::default(),
        }
    }
}

/// Entity lifecycle and confidence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    /// Entities unseen for this long become dormant and are evicted (seconds)
    pub inactivity_horizon_secs: i64,
    /// Half-life of confidence staleness decay (seconds)
    pub confidence_half_life_secs: f64,
    /// Fraction of the remaining headroom gained per corroborated match
    pub corroboration_gain: f64,
    /// Multiplicative decay per single-modality match
    pub single_modality_decay: f64,
    /// Confidence never decays below this floor
    pub confidence_floor: f64,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            inactivity_horizon_secs: 1_800,
            confidence_half_life_secs: 600.0,
            corroboration_gain: 0.25,
            single_modality_decay: 0.98,
            confidence_floor: 0.1,
        }
    }
}

/// Window manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub window_size_secs: i64,
    /// Slack subtracted from the maximum observed timestamp to form the watermark
    pub allowed_lateness_secs: i64,
    pub late_policy: LatePolicy,
    /// How long closed windows are retained for corrections under `reopen` (seconds)
    pub correction_horizon_secs: i64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size_secs: 60,
            allowed_lateness_secs: 10,
            late_policy: LatePolicy::Drop,
            correction_horizon_secs: 300,
        }
    }
}

impl WindowConfig {
    pub fn window_size(&self) -> Duration {
        Duration::seconds(self.window_size_secs)
    }

    pub fn allowed_lateness(&self) -> Duration {
        Duration::seconds(self.allowed_lateness_secs)
    }
}

/// Retry backoff for consumer delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial backoff delay (milliseconds)
    pub initial_delay_ms: u64,
    /// Maximum backoff delay (milliseconds)
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        std::time::Duration::from_millis(capped as u64)
    }
}

/// Dispatch router settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Total delivery attempts per consumer before giving up
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    /// Per-attempt acknowledgment timeout (milliseconds)
    pub delivery_timeout_ms: u64,
    pub consumer_queue_capacity: usize,
    pub report_queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffConfig::default(),
            delivery_timeout_ms: 2_000,
            consumer_queue_capacity: 256,
            report_queue_capacity: 256,
        }
    }
}

/// Stage parallelism and queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub resolver_shards: usize,
    pub fusion_workers: usize,
    /// Capacity of each per-modality intake queue
    pub intake_capacity: usize,
    /// Capacity of every inter-stage queue
    pub stage_capacity: usize,
    /// Coarse cell size used to place new sources on shards (degrees)
    pub shard_cell_deg: f64,
    /// Minimum watermark progress before shards are notified (milliseconds)
    pub watermark_broadcast_ms: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            resolver_shards: 4,
            fusion_workers: 2,
            intake_capacity: 1_024,
            stage_capacity: 1_024,
            shard_cell_deg: 0.1,
            watermark_broadcast_ms: 1_000,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub normalizer: NormalizerConfig,
    pub matching: MatchingConfig,
    pub entities: EntityConfig,
    pub window: WindowConfig,
    pub dispatch: DispatchConfig,
    pub runtime: RuntimeConfig,
}

impl FusionConfig {
    /// Load configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self, FusionError> {
        let config: FusionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FusionError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String, FusionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), FusionError> {
        let invalid = |msg: &str| Err(FusionError::InvalidConfig(msg.to_string()));

        if self.window.window_size_secs <= 0 {
            return invalid("window.window_size_secs must be positive");
        }
        if self.window.allowed_lateness_secs < 0 {
            return invalid("window.allowed_lateness_secs must not be negative");
        }
        if self.window.correction_horizon_secs < 0 {
            return invalid("window.correction_horizon_secs must not be negative");
        }
        let durations = [
            self.window.window_size_secs,
            self.window.allowed_lateness_secs,
            self.window.correction_horizon_secs,
            self.entities.inactivity_horizon_secs,
            self.matching.staleness.gps_secs,
            self.matching.staleness.cdr_secs,
            self.matching.staleness.probe_secs,
            self.normalizer.clock_skew_tolerance_secs,
        ];
        if durations.iter().any(|secs| *secs > MAX_DURATION_SECS) {
            return invalid("durations must not exceed one year");
        }
        if self.normalizer.clock_skew_tolerance_secs < 0 {
            return invalid("normalizer.clock_skew_tolerance_secs must not be negative");
        }
        if self.entities.inactivity_horizon_secs
            < self.window.window_size_secs + self.window.allowed_lateness_secs
        {
            return invalid(
                "entities.inactivity_horizon_secs must cover window_size_secs + allowed_lateness_secs",
            );
        }
        if !(self.entities.confidence_half_life_secs > 0.0)
            || !self.entities.confidence_half_life_secs.is_finite()
        {
            return invalid("entities.confidence_half_life_secs must be positive");
        }
        if !(self.matching.max_speed_mps >= 0.0) || !self.matching.max_speed_mps.is_finite() {
            return invalid("matching.max_speed_mps must not be negative");
        }
        if !(self.matching.acceptance_threshold > 0.0) {
            return invalid("matching.acceptance_threshold must be positive");
        }
        if self.matching.spatial_weight < 0.0 || self.matching.temporal_weight < 0.0 {
            return invalid("matching weights must not be negative");
        }
        if !(self.matching.grid_cell_deg > 0.0) || !(self.runtime.shard_cell_deg > 0.0) {
            return invalid("grid cell sizes must be positive");
        }
        if !(0.0..=1.0).contains(&self.matching.same_source_affinity) {
            return invalid("matching.same_source_affinity must be within 0-1");
        }
        let staleness = &self.matching.staleness;
        if staleness.gps_secs <= 0 || staleness.cdr_secs <= 0 || staleness.probe_secs <= 0 {
            return invalid("matching.staleness bounds must be positive");
        }
        for (name, model) in [("cdr", &self.normalizer.cdr), ("probe", &self.normalizer.probe)] {
            if !(model.exponent > 0.0) || !(model.min_radius_m > 0.0) || model.max_radius_m < model.min_radius_m
            {
                return Err(FusionError::InvalidConfig(format!(
                    "normalizer.{name} path loss model is inconsistent"
                )));
            }
        }
        if !(self.normalizer.default_gps_accuracy_m > 0.0) {
            return invalid("normalizer.default_gps_accuracy_m must be positive");
        }
        if !(self.dispatch.backoff.multiplier >= 1.0) || !self.dispatch.backoff.multiplier.is_finite() {
            return invalid("dispatch.backoff.multiplier must be at least 1");
        }
        if self.dispatch.max_retries == 0 {
            return invalid("dispatch.max_retries must be at least 1");
        }
        if self.runtime.resolver_shards == 0 || self.runtime.fusion_workers == 0 {
            return invalid("runtime shard and worker counts must be at least 1");
        }
        if self.runtime.intake_capacity == 0
            || self.runtime.stage_capacity == 0
            || self.dispatch.consumer_queue_capacity == 0
            || self.dispatch.report_queue_capacity == 0
        {
            return invalid("queue capacities must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(FusionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = FusionConfig::from_json(
            r#"{ "window": { "window_size_secs": 10, "late_policy": "reopen" } }"#,
        )
        .unwrap();

        assert_eq!(config.window.window_size_secs, 10);
        assert_eq!(config.window.late_policy, LatePolicy::Reopen);
        assert_eq!(config.window.allowed_lateness_secs, 10);
        assert_eq!(config.matching.staleness.gps_secs, 30);
    }

    #[test]
    fn test_rejects_horizon_shorter_than_window() {
        let mut config = FusionConfig::default();
        config.entities.inactivity_horizon_secs = 30;
        assert!(matches!(
            config.validate(),
            Err(FusionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_durations_beyond_one_year() {
        let mut config = FusionConfig::default();
        config.window.allowed_lateness_secs = i64::MAX / 1_000;
        assert!(matches!(config.validate(), Err(FusionError::InvalidConfig(_))));

        let mut config = FusionConfig::default();
        config.normalizer.clock_skew_tolerance_secs = MAX_DURATION_SECS + 1;
        assert!(matches!(config.validate(), Err(FusionError::InvalidConfig(_))));

        let mut config = FusionConfig::default();
        config.normalizer.clock_skew_tolerance_secs = -1;
        assert!(matches!(config.validate(), Err(FusionError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_degenerate_decay_speed_and_backoff() {
        let mut config = FusionConfig::default();
        config.entities.confidence_half_life_secs = 0.0;
        assert!(matches!(config.validate(), Err(FusionError::InvalidConfig(_))));

        let mut config = FusionConfig::default();
        config.entities.confidence_half_life_secs = f64::NAN;
        assert!(matches!(config.validate(), Err(FusionError::InvalidConfig(_))));

        let mut config = FusionConfig::default();
        config.matching.max_speed_mps = -1.0;
        assert!(matches!(config.validate(), Err(FusionError::InvalidConfig(_))));

        let mut config = FusionConfig::default();
        config.dispatch.backoff.multiplier = 0.5;
        assert!(matches!(config.validate(), Err(FusionError::InvalidConfig(_))));

        let mut config = FusionConfig::default();
        config.matching.max_speed_mps = 0.0;
        config.dispatch.backoff.multiplier = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let backoff = BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for(1).as_millis(), 100);
        assert_eq!(backoff.delay_for(2).as_millis(), 200);
        assert_eq!(backoff.delay_for(3).as_millis(), 400);
        assert_eq!(backoff.delay_for(10).as_millis(), 1_000);
    }

    #[test]
    fn test_late_policy_from_str() {
        assert_eq!("DROP".parse::<LatePolicy>().unwrap(), LatePolicy::Drop);
        assert_eq!("reopen".parse::<LatePolicy>().unwrap(), LatePolicy::Reopen);
        assert!("later".parse::<LatePolicy>().is_err());
    }
}
