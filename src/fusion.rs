//! Window fusion
//!
//! Combines the evidence of one ready window into a fused snapshot:
//! - `fused_location` is the centroid weighted by `1 / accuracy²`
//! - `location_uncertainty_m` combines per-modality radii as independent
//!   measurements; samples of one modality only shrink their modality's
//!   radius by `n^(1/4)`, so a second modality tightens the estimate faster
//!   than more samples of the first
//!
//! Fusion is a pure function of the evidence set. Evidence is sorted into a
//! canonical order before summing so floating point results do not depend on
//! arrival order.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::FusionError;
use crate::geo::normalize_lon;
use crate::types::{EvidenceWindow, FusedSnapshot, GeoPoint, Modality, PositionalEvidence};

/// Radii below this are treated as this, keeping weights finite
const MIN_RADIUS_M: f64 = 1e-3;

/// Stateless fusion of evidence windows
#[derive(Debug, Clone, Copy, Default)]
pub struct FusionEngine;

impl FusionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Fuse a ready window, stamping the snapshot with the current time
    pub fn fuse(&self, window: &EvidenceWindow) -> Result<FusedSnapshot, FusionError> {
        self.fuse_at(window, Utc::now())
    }

    /// Fuse a ready window with an explicit generation time
    pub fn fuse_at(
        &self,
        window: &EvidenceWindow,
        generated_at: DateTime<Utc>,
    ) -> Result<FusedSnapshot, FusionError> {
        if window.evidence.is_empty() {
            return Err(FusionError::EmptyWindowSkip {
                entity_id: window.entity_id,
                window_start: window.window_start,
            });
        }

        let mut evidence: Vec<&PositionalEvidence> = window.evidence.iter().collect();
        evidence.sort_by(|a, b| canonical_order(a, b));

        Ok(FusedSnapshot {
            entity_id: window.entity_id,
            window_start: window.window_start,
            window_end: window.window_end,
            fused_location: weighted_centroid(&evidence),
            location_uncertainty_m: combined_uncertainty(&evidence),
            contributing_modalities: evidence
                .iter()
                .map(|e| e.modality)
                .collect::<BTreeSet<_>>(),
            evidence_count: evidence.len(),
            entity_confidence: window.entity_confidence,
            kind: window.kind(),
            revision: window.revision,
            generated_at,
        })
    }
}

fn canonical_order(a: &PositionalEvidence, b: &PositionalEvidence) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then(a.modality.cmp(&b.modality))
        .then_with(|| a.source_id.cmp(&b.source_id))
        .then_with(|| a.raw_payload_ref.cmp(&b.raw_payload_ref))
        .then_with(|| a.location.lat.total_cmp(&b.location.lat))
        .then_with(|| a.location.lon.total_cmp(&b.location.lon))
        .then_with(|| a.location.accuracy_m.total_cmp(&b.location.accuracy_m))
}

fn weight(accuracy_m: f64) -> f64 {
    let r = accuracy_m.max(MIN_RADIUS_M);
    1.0 / (r * r)
}

/// Inverse-variance weighted centroid; longitudes are unwrapped around the
/// first point so windows straddling the antimeridian stay contiguous.
fn weighted_centroid(evidence: &[&PositionalEvidence]) -> GeoPoint {
    let origin_lon = evidence[0].location.lon;
    let mut total = 0.0;
    let mut lat = 0.0;
    let mut dlon = 0.0;
    for e in evidence {
        let w = weight(e.location.accuracy_m);
        total += w;
        lat += w * e.location.lat;
        dlon += w * normalize_lon(e.location.lon - origin_lon);
    }
    GeoPoint::new(lat / total, normalize_lon(origin_lon + dlon / total))
}

fn combined_uncertainty(evidence: &[&PositionalEvidence]) -> f64 {
    // modality -> (sum of weights, sum of weighted radii, samples)
    let mut per_modality: BTreeMap<Modality, (f64, f64, usize)> = BTreeMap::new();
    for e in evidence {
        let r = e.location.accuracy_m.max(MIN_RADIUS_M);
        let w = weight(r);
        let entry = per_modality.entry(e.modality).or_insert((0.0, 0.0, 0));
        entry.0 += w;
        entry.1 += w * r;
        entry.2 += 1;
    }

    let precision: f64 = per_modality
        .values()
        .map(|(sum_w, sum_wr, n)| {
            let radius = (sum_wr / sum_w) / (*n as f64).powf(0.25);
            1.0 / (radius * radius)
        })
        .sum();
    1.0 / precision.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, Location, SnapshotKind};
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
    }

    fn evidence(modality: Modality, secs: i64, lat: f64, lon: f64, acc: f64) -> PositionalEvidence {
        PositionalEvidence {
            modality,
            source_id: format!("{modality}-src"),
            timestamp: t0() + Duration::seconds(secs),
            location: Location::new(lat, lon, acc),
            signal_strength_dbm: None,
            speed_mps: None,
            raw_payload_ref: format!("{modality}:{secs}"),
        }
    }

    fn window(evidence: Vec<PositionalEvidence>) -> EvidenceWindow {
        let mut window = EvidenceWindow::new(EntityId::new(), t0(), t0() + Duration::seconds(10));
        window.evidence = evidence;
        window
    }

    #[test]
    fn test_two_gps_fixes_fuse_to_centroid() {
        let w = window(vec![
            evidence(Modality::Gps, 0, 40.0, -73.0, 5.0),
            evidence(Modality::Gps, 8, 40.0001, -73.0001, 5.0),
        ]);
        let snapshot = FusionEngine.fuse_at(&w, t0()).unwrap();

        assert!((snapshot.fused_location.lat - 40.00005).abs() < 1e-9);
        assert!((snapshot.fused_location.lon + 73.00005).abs() < 1e-9);
        assert_eq!(snapshot.window_start, t0());
        assert_eq!(snapshot.window_end, t0() + Duration::seconds(10));
        assert_eq!(snapshot.evidence_count, 2);
        assert_eq!(snapshot.kind, SnapshotKind::Initial);
        assert_eq!(
            snapshot.contributing_modalities,
            BTreeSet::from([Modality::Gps])
        );
        assert!((snapshot.location_uncertainty_m - 5.0 / 2f64.powf(0.25)).abs() < 1e-9);
    }

    #[test]
    fn test_weights_favor_accurate_evidence() {
        let w = window(vec![
            evidence(Modality::Gps, 0, 40.0, -73.0, 5.0),
            evidence(Modality::Cdr, 1, 40.01, -73.0, 500.0),
        ]);
        let snapshot = FusionEngine.fuse_at(&w, t0()).unwrap();
        // weight ratio 1:10^-4
        assert!((snapshot.fused_location.lat - 40.0).abs() < 0.00001);
    }

    #[test]
    fn test_single_gps_point_keeps_its_radius() {
        let w = window(vec![evidence(Modality::Gps, 0, 40.0, -73.0, 5.0)]);
        let snapshot = FusionEngine.fuse_at(&w, t0()).unwrap();
        assert!((snapshot.location_uncertainty_m - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_corroborating_cdr_reduces_uncertainty() {
        let gps = evidence(Modality::Gps, 0, 40.0, -73.0, 5.0);
        let cdr = evidence(Modality::Cdr, 3, 40.001, -73.0, 800.0);

        let alone = FusionEngine.fuse_at(&window(vec![gps.clone()]), t0()).unwrap();
        let both = FusionEngine.fuse_at(&window(vec![gps, cdr]), t0()).unwrap();

        assert!(both.location_uncertainty_m < alone.location_uncertainty_m);
        assert_eq!(
            both.contributing_modalities,
            BTreeSet::from([Modality::Gps, Modality::Cdr])
        );
    }

    #[test]
    fn test_second_modality_beats_more_samples() {
        let same = window(vec![
            evidence(Modality::Gps, 0, 40.0, -73.0, 20.0),
            evidence(Modality::Gps, 1, 40.0, -73.0, 20.0),
        ]);
        let mixed = window(vec![
            evidence(Modality::Gps, 0, 40.0, -73.0, 20.0),
            evidence(Modality::Probe, 1, 40.0, -73.0, 20.0),
        ]);

        let same = FusionEngine.fuse_at(&same, t0()).unwrap();
        let mixed = FusionEngine.fuse_at(&mixed, t0()).unwrap();
        assert!(mixed.location_uncertainty_m < same.location_uncertainty_m);
    }

    #[test]
    fn test_refusion_is_deterministic() {
        let items = vec![
            evidence(Modality::Gps, 0, 40.0, -73.0, 7.0),
            evidence(Modality::Probe, 2, 40.0003, -73.0002, 35.0),
            evidence(Modality::Cdr, 5, 40.002, -72.999, 600.0),
            evidence(Modality::Gps, 6, 40.00011, -73.00007, 4.0),
        ];
        let mut reversed = items.clone();
        reversed.reverse();

        let w1 = window(items);
        let mut w2 = w1.clone();
        w2.evidence = reversed;

        let a = FusionEngine.fuse_at(&w1, t0()).unwrap();
        let b = FusionEngine.fuse_at(&w1, t0()).unwrap();
        let c = FusionEngine.fuse_at(&w2, t0()).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.fused_location.lat.to_bits(), c.fused_location.lat.to_bits());
        assert_eq!(a.fused_location.lon.to_bits(), c.fused_location.lon.to_bits());
        assert_eq!(
            a.location_uncertainty_m.to_bits(),
            c.location_uncertainty_m.to_bits()
        );
    }

    #[test]
    fn test_antimeridian_window() {
        let w = window(vec![
            evidence(Modality::Gps, 0, 0.0, 179.9999, 5.0),
            evidence(Modality::Gps, 1, 0.0, -179.9999, 5.0),
        ]);
        let snapshot = FusionEngine.fuse_at(&w, t0()).unwrap();
        assert!(snapshot.fused_location.lon.abs() > 179.999);
    }

    #[test]
    fn test_empty_window_is_skipped() {
        let w = window(Vec::new());
        assert!(matches!(
            FusionEngine.fuse_at(&w, t0()),
            Err(FusionError::EmptyWindowSkip { .. })
        ));
    }

    #[test]
    fn test_correction_carries_revision() {
        let mut w = window(vec![evidence(Modality::Gps, 0, 40.0, -73.0, 5.0)]);
        w.revision = 2;
        let snapshot = FusionEngine.fuse_at(&w, t0()).unwrap();
        assert_eq!(snapshot.kind, SnapshotKind::Correction);
        assert_eq!(snapshot.revision, 2);
    }
}
