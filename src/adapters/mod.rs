//! Modality adapters
//!
//! This module provides adapters that read one raw modality record and locate
//! it: a timestamp, a position and an accuracy radius. Range and skew checks
//! are left to the normalizer so every modality is held to the same rules.

mod cdr;
mod gps;
mod probe;

pub use cdr::CdrAdapter;
pub use gps::GpsAdapter;
pub use probe::ProbeAdapter;

use chrono::{DateTime, Utc};

use crate::config::{NormalizerConfig, PathLossModel};
use crate::error::FusionError;
use crate::types::{GeoPoint, Location, Modality};

/// A raw record placed in space and time, before validation
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub location: Location,
    pub signal_strength_dbm: Option<f64>,
    pub speed_mps: Option<f64>,
}

/// Trait for modality adapters
pub trait ModalityAdapter {
    /// Raw record type this adapter reads
    type Record;

    fn modality(&self) -> Modality;

    /// Locate a raw record
    fn locate(
        &self,
        record: &Self::Record,
        config: &NormalizerConfig,
    ) -> Result<Observation, FusionError>;
}

/// Estimate range from received strength using a log-distance path loss model.
///
/// Missing or non-finite strength falls back to the model's maximum radius, the
/// coverage one would assume from the anchor position alone.
pub fn strength_to_radius(model: &PathLossModel, strength_dbm: Option<f64>) -> f64 {
    match strength_dbm.filter(|s| s.is_finite()) {
        Some(dbm) => {
            let distance = 10f64.powf((model.reference_dbm - dbm) / (10.0 * model.exponent));
            distance.clamp(model.min_radius_m, model.max_radius_m)
        }
        None => model.max_radius_m,
    }
}

/// Position of a fixed anchor: inline coordinates first, then the registry
pub(crate) fn resolve_anchor(
    modality: Modality,
    anchor_id: Option<&str>,
    lat: Option<f64>,
    lon: Option<f64>,
    config: &NormalizerConfig,
) -> Result<GeoPoint, FusionError> {
    match (lat, lon) {
        (Some(lat), Some(lon)) => Ok(GeoPoint::new(lat, lon)),
        (Some(_), None) | (None, Some(_)) => Err(FusionError::malformed(
            modality,
            "anchor has only one coordinate",
        )),
        (None, None) => {
            let id = anchor_id.ok_or_else(|| {
                FusionError::malformed(modality, "no anchor coordinates or anchor id")
            })?;
            config.anchors.get(id).copied().ok_or_else(|| {
                FusionError::malformed(modality, format!("unknown anchor '{id}'"))
            })
        }
    }
}

pub(crate) fn require_timestamp(
    modality: Modality,
    timestamp: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>, FusionError> {
    timestamp.ok_or_else(|| FusionError::malformed(modality, "missing timestamp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strength_to_radius_monotonic() {
        let model = PathLossModel {
            reference_dbm: -40.0,
            exponent: 3.0,
            min_radius_m: 5.0,
            max_radius_m: 150.0,
        };
        let strong = strength_to_radius(&model, Some(-55.0));
        let weak = strength_to_radius(&model, Some(-85.0));
        assert!(strong < weak);
        // -55 dBm: 10^(15/30) ~ 3.2 m, clamped to the minimum
        assert_eq!(strong, 5.0);
        assert_eq!(strength_to_radius(&model, Some(-140.0)), 150.0);
        assert_eq!(strength_to_radius(&model, None), 150.0);
        assert_eq!(strength_to_radius(&model, Some(f64::NAN)), 150.0);
    }
}
