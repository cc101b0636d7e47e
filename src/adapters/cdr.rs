//! CDR adapter
//!
//! Call-detail records carry no coordinates of the subscriber, only the serving
//! tower. The subscriber is placed at the tower (or, for sectorized cells,
//! part-way along the sector bearing) with a radius derived from signal strength.

use super::{require_timestamp, resolve_anchor, strength_to_radius, ModalityAdapter, Observation};
use crate::config::NormalizerConfig;
use crate::error::FusionError;
use crate::geo::destination;
use crate::schema::CallDetailRecord;
use crate::types::{Location, Modality};

/// Call-detail record adapter
pub struct CdrAdapter;

impl ModalityAdapter for CdrAdapter {
    type Record = CallDetailRecord;

    fn modality(&self) -> Modality {
        Modality::Cdr
    }

    fn locate(
        &self,
        cdr: &CallDetailRecord,
        config: &NormalizerConfig,
    ) -> Result<Observation, FusionError> {
        let timestamp = require_timestamp(Modality::Cdr, cdr.timestamp)?;
        let tower = resolve_anchor(
            Modality::Cdr,
            cdr.tower_id.as_deref(),
            cdr.tower_lat,
            cdr.tower_lon,
            config,
        )?;
        let range_m = strength_to_radius(&config.cdr, cdr.signal_dbm);

        let location = match cdr.sector_azimuth_deg.filter(|az| az.is_finite()) {
            Some(azimuth) => {
                // The subscriber lies inside the sector wedge; its midpoint halves the error.
                let center = destination(tower, azimuth, range_m / 2.0);
                let radius = (range_m / 2.0).max(config.cdr.min_radius_m);
                Location::new(center.lat, center.lon, radius)
            }
            None => Location::new(tower.lat, tower.lon, range_m),
        };

        Ok(Observation {
            source_id: cdr.subscriber_id.clone(),
            timestamp,
            location,
            signal_strength_dbm: cdr.signal_dbm,
            speed_mps: None,
        })
    }
}
