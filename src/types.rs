//! Core types for the Mobility Flux pipeline
//!
//! This module defines the records that flow between stages: positional
//! evidence, mobile entities, evidence windows and fused snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Category of raw mobility signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Gps,
    Cdr,
    Probe,
}

impl Modality {
    pub const ALL: [Modality; 3] = [Modality::Gps, Modality::Cdr, Modality::Probe];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Gps => "gps",
            Modality::Cdr => "cdr",
            Modality::Probe => "probe",
        }
    }

    /// Stable index used by per-modality counters
    pub fn index(&self) -> usize {
        match self {
            Modality::Gps => 0,
            Modality::Cdr => 1,
            Modality::Probe => 2,
        }
    }

    /// Whether one entity may carry at most one active source of this modality.
    ///
    /// Probe MAC addresses are randomized by handsets, so a subject legitimately
    /// shows up under several probe sources.
    pub fn is_source_exclusive(&self) -> bool {
        matches!(self, Modality::Gps | Modality::Cdr)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WGS84 coordinate pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// A position with its 1-sigma accuracy radius
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    /// Accuracy radius (meters)
    pub accuracy_m: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64, accuracy_m: f64) -> Self {
        Self {
            lat,
            lon,
            accuracy_m,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

/// Persistent identity of one real-world moving subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One normalized observation of a subject's position at a time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionalEvidence {
    pub modality: Modality,
    /// Device, subscriber or MAC identifier reported by the source
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub location: Location,
    /// Received signal strength (dBm) for CDR and probe evidence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength_dbm: Option<f64>,
    /// Reported ground speed (m/s), when the source provides one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
    /// Reference to the raw record this evidence was derived from
    pub raw_payload_ref: String,
}

/// Tracked state of a mobile entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobileEntity {
    pub entity_id: EntityId,
    pub last_known_location: Location,
    pub last_seen: DateTime<Utc>,
    pub active_modalities: BTreeSet<Modality>,
    /// Identity confidence (0-1)
    pub confidence_score: f64,
    pub created_at: DateTime<Utc>,
    /// Last time each modality contributed evidence
    pub modality_last_seen: BTreeMap<Modality, DateTime<Utc>>,
    /// Most recent source bound to this entity per modality
    pub sources: BTreeMap<Modality, String>,
    /// Consecutive matches without a second active modality
    pub single_modality_run: u32,
    pub evidence_count: u64,
}

/// Whether a snapshot is the first fusion of its window or a re-fusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Initial,
    Correction,
}

/// Per-entity buffer of evidence for `[window_start, window_end)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceWindow {
    pub entity_id: EntityId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Watermark at the time the window was handed to fusion
    pub watermark: Option<DateTime<Utc>>,
    pub evidence: Vec<PositionalEvidence>,
    /// 0 for the first fusion, incremented per correction
    pub revision: u32,
    /// Entity confidence at hand-off time
    pub entity_confidence: f64,
}

impl EvidenceWindow {
    pub fn new(entity_id: EntityId, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            window_start,
            window_end,
            watermark: None,
            evidence: Vec::new(),
            revision: 0,
            entity_confidence: 0.0,
        }
    }

    pub fn kind(&self) -> SnapshotKind {
        if self.revision == 0 {
            SnapshotKind::Initial
        } else {
            SnapshotKind::Correction
        }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.window_start && timestamp < self.window_end
    }
}

/// Fused position estimate of one entity over one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedSnapshot {
    pub entity_id: EntityId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub fused_location: GeoPoint,
    /// Uncertainty radius of the fused location (meters)
    pub location_uncertainty_m: f64,
    pub contributing_modalities: BTreeSet<Modality>,
    pub evidence_count: usize,
    pub entity_confidence: f64,
    pub kind: SnapshotKind,
    pub revision: u32,
    pub generated_at: DateTime<Utc>,
}

impl FusedSnapshot {
    /// Idempotency key: one snapshot per `(entity, window, revision)`
    pub fn fusion_key(&self) -> (EntityId, DateTime<Utc>, u32) {
        (self.entity_id, self.window_start, self.revision)
    }
}
