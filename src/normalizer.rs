//! Signal normalization
//!
//! This module turns one raw modality record into a `PositionalEvidence`.
//! - Modality adapters locate the record (coordinates or derived coordinates)
//! - Coordinates are range-checked and optionally bounded to a service area
//! - Timestamps too far in the future are rejected
//!
//! The normalizer is stateless; the same input always yields the same output.

use chrono::{DateTime, Duration, Utc};

use crate::adapters::{CdrAdapter, GpsAdapter, ModalityAdapter, Observation, ProbeAdapter};
use crate::config::NormalizerConfig;
use crate::error::FusionError;
use crate::schema::RawEvent;
use crate::types::{Modality, PositionalEvidence};

/// Normalizer for converting raw modality records to positional evidence
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Normalize one raw record, checking its timestamp against `now`
    pub fn normalize(
        &self,
        raw: &RawEvent,
        now: DateTime<Utc>,
    ) -> Result<PositionalEvidence, FusionError> {
        let modality = raw.modality();
        let observation = match raw {
            RawEvent::Gps(fix) => GpsAdapter.locate(fix, &self.config)?,
            RawEvent::Cdr(cdr) => CdrAdapter.locate(cdr, &self.config)?,
            RawEvent::Probe(probe) => ProbeAdapter.locate(probe, &self.config)?,
        };

        self.check(modality, &observation, now)?;

        let raw_payload_ref = match raw.event_id() {
            Some(id) => id.to_string(),
            None => format!(
                "{}:{}:{}",
                modality,
                observation.source_id,
                observation.timestamp.timestamp_millis()
            ),
        };

        Ok(PositionalEvidence {
            modality,
            source_id: observation.source_id,
            timestamp: observation.timestamp,
            location: observation.location,
            signal_strength_dbm: observation.signal_strength_dbm,
            speed_mps: observation.speed_mps,
            raw_payload_ref,
        })
    }

    fn check(
        &self,
        modality: Modality,
        obs: &Observation,
        now: DateTime<Utc>,
    ) -> Result<(), FusionError> {
        if obs.source_id.trim().is_empty() {
            return Err(FusionError::malformed(modality, "empty source id"));
        }

        let loc = &obs.location;
        if !loc.lat.is_finite() || !(-90.0..=90.0).contains(&loc.lat) {
            return Err(FusionError::malformed(
                modality,
                format!("latitude {} out of range", loc.lat),
            ));
        }
        if !loc.lon.is_finite() || !(-180.0..=180.0).contains(&loc.lon) {
            return Err(FusionError::malformed(
                modality,
                format!("longitude {} out of range", loc.lon),
            ));
        }
        if !loc.accuracy_m.is_finite() || loc.accuracy_m <= 0.0 {
            return Err(FusionError::malformed(
                modality,
                format!("accuracy radius {} is not positive", loc.accuracy_m),
            ));
        }

        // Window and watermark arithmetic assumes epoch-relative timestamps
        if obs.timestamp.timestamp() < 0 {
            return Err(FusionError::malformed(
                modality,
                format!(
                    "timestamp {} predates the Unix epoch",
                    obs.timestamp.to_rfc3339()
                ),
            ));
        }
        let skew = Duration::seconds(self.config.clock_skew_tolerance_secs);
        if obs.timestamp > now + skew {
            return Err(FusionError::malformed(
                modality,
                format!(
                    "timestamp {} is beyond the clock skew tolerance",
                    obs.timestamp.to_rfc3339()
                ),
            ));
        }

        if let Some(area) = &self.config.service_area {
            if !area.contains(loc.lat, loc.lon) {
                return Err(FusionError::malformed(
                    modality,
                    format!("({}, {}) is outside the service area", loc.lat, loc.lon),
                ));
            }
        }

        Ok(())
    }
}
