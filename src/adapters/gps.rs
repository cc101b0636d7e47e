//! GPS adapter
//!
//! Maps a positioning fix straight through; accuracy is whatever the receiver
//! reported, or the configured default when the fix omits it.

use super::{require_timestamp, ModalityAdapter, Observation};
use crate::config::NormalizerConfig;
use crate::error::FusionError;
use crate::schema::GpsFix;
use crate::types::{Location, Modality};

/// GPS fix adapter
pub struct GpsAdapter;

impl ModalityAdapter for GpsAdapter {
    type Record = GpsFix;

    fn modality(&self) -> Modality {
        Modality::Gps
    }

    fn locate(
        &self,
        fix: &GpsFix,
        config: &NormalizerConfig,
    ) -> Result<Observation, FusionError> {
        let timestamp = require_timestamp(Modality::Gps, fix.timestamp)?;
        let (lat, lon) = match (fix.lat, fix.lon) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => return Err(FusionError::malformed(Modality::Gps, "missing coordinates")),
        };

        let accuracy_m = match fix.accuracy_m {
            Some(acc) if acc.is_finite() && acc > 0.0 => acc,
            Some(acc) => {
                return Err(FusionError::malformed(
                    Modality::Gps,
                    format!("invalid accuracy {acc}"),
                ))
            }
            None => config.default_gps_accuracy_m,
        };

        Ok(Observation {
            source_id: fix.device_id.clone(),
            timestamp,
            location: Location::new(lat, lon, accuracy_m),
            signal_strength_dbm: None,
            speed_mps: fix
                .speed_kmph
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(|kmph| kmph / 3.6),
        })
    }
}
