//! Probe-request adapter

use super::{require_timestamp, resolve_anchor, strength_to_radius, ModalityAdapter, Observation};
use crate::config::NormalizerConfig;
use crate::error::FusionError;
use crate::schema::ProbeSighting;
use crate::types::{Location, Modality};

/// Wireless probe sighting adapter
pub struct ProbeAdapter;

impl ModalityAdapter for ProbeAdapter {
    type Record = ProbeSighting;

    fn modality(&self) -> Modality {
        Modality::Probe
    }

    fn locate(
        &self,
        sighting: &ProbeSighting,
        config: &NormalizerConfig,
    ) -> Result<Observation, FusionError> {
        let timestamp = require_timestamp(Modality::Probe, sighting.timestamp)?;
        let sensor = resolve_anchor(
            Modality::Probe,
            sighting.sensor_id.as_deref(),
            sighting.sensor_lat,
            sighting.sensor_lon,
            config,
        )?;
        let radius = strength_to_radius(&config.probe, sighting.rssi_dbm);

        Ok(Observation {
            source_id: sighting.device_hash.clone(),
            timestamp,
            location: Location::new(sensor.lat, sensor.lon, radius),
            signal_strength_dbm: sighting.rssi_dbm,
            speed_mps: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_inline_sensor_position() {
        let sighting = ProbeSighting {
            event_id: None,
            device_hash: "ab12".to_string(),
            timestamp: Some(Utc::now()),
            sensor_id: None,
            sensor_lat: Some(26.85),
            sensor_lon: Some(80.95),
            rssi_dbm: Some(-70.0),
        };
        let obs = ProbeAdapter
            .locate(&sighting, &NormalizerConfig::default())
            .unwrap();
        assert_eq!(obs.location.lat, 26.85);
        // -70 dBm at exponent 3: 10 m
        assert!((obs.location.accuracy_m - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_half_coordinates_are_malformed() {
        let sighting = ProbeSighting {
            event_id: None,
            device_hash: "ab12".to_string(),
            timestamp: Some(Utc::now()),
            sensor_id: None,
            sensor_lat: Some(26.85),
            sensor_lon: None,
            rssi_dbm: None,
        };
        assert!(ProbeAdapter
            .locate(&sighting, &NormalizerConfig::default())
            .is_err());
    }
}
