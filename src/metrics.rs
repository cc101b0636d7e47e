//! Observability counters
//!
//! Counters are plain atomics shared by every stage; external monitoring reads
//! them through [`FluxMetrics::snapshot`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Modality;

/// Live pipeline counters
#[derive(Debug, Default)]
pub struct FluxMetrics {
    evidence_ingested: [AtomicU64; 3],
    malformed_rejected: AtomicU64,
    entities_created: AtomicU64,
    entities_evicted: AtomicU64,
    eviction_races: AtomicU64,
    windows_fused: AtomicU64,
    empty_windows_skipped: AtomicU64,
    late_dropped: AtomicU64,
    corrections_emitted: AtomicU64,
    snapshots_delivered: AtomicU64,
    dispatch_failures: AtomicU64,
}

impl FluxMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ingested(&self, modality: Modality) {
        self.evidence_ingested[modality.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_entity_created(&self) {
        self.entities_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_entities_evicted(&self, count: usize) {
        self.entities_evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_eviction_race(&self) {
        self.eviction_races.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_fused(&self) {
        self.windows_fused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_window(&self) {
        self.empty_windows_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_drop(&self) {
        self.late_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_correction(&self) {
        self.corrections_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.snapshots_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn late_dropped(&self) -> u64 {
        self.late_dropped.load(Ordering::Relaxed)
    }

    pub fn dispatch_failures(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            evidence_ingested: Modality::ALL
                .iter()
                .map(|m| (*m, load(&self.evidence_ingested[m.index()])))
                .collect(),
            malformed_rejected: load(&self.malformed_rejected),
            entities_created: load(&self.entities_created),
            entities_evicted: load(&self.entities_evicted),
            eviction_races: load(&self.eviction_races),
            windows_fused: load(&self.windows_fused),
            empty_windows_skipped: load(&self.empty_windows_skipped),
            late_dropped: load(&self.late_dropped),
            corrections_emitted: load(&self.corrections_emitted),
            snapshots_delivered: load(&self.snapshots_delivered),
            dispatch_failures: load(&self.dispatch_failures),
        }
    }
}

/// Serializable copy of [`FluxMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub evidence_ingested: BTreeMap<Modality, u64>,
    pub malformed_rejected: u64,
    pub entities_created: u64,
    pub entities_evicted: u64,
    pub eviction_races: u64,
    pub windows_fused: u64,
    pub empty_windows_skipped: u64,
    pub late_dropped: u64,
    pub corrections_emitted: u64,
    pub snapshots_delivered: u64,
    pub dispatch_failures: u64,
}

impl MetricsSnapshot {
    pub fn ingested(&self, modality: Modality) -> u64 {
        self.evidence_ingested.get(&modality).copied().unwrap_or(0)
    }

    pub fn total_ingested(&self) -> u64 {
        self.evidence_ingested.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = FluxMetrics::new();
        metrics.record_ingested(Modality::Gps);
        metrics.record_ingested(Modality::Gps);
        metrics.record_ingested(Modality::Probe);
        metrics.record_entities_evicted(3);
        metrics.record_late_drop();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.ingested(Modality::Gps), 2);
        assert_eq!(snapshot.ingested(Modality::Cdr), 0);
        assert_eq!(snapshot.total_ingested(), 3);
        assert_eq!(snapshot.entities_evicted, 3);
        assert_eq!(snapshot.late_dropped, 1);
    }

    #[test]
    fn test_snapshot_serializes_modality_keys() {
        let metrics = FluxMetrics::new();
        metrics.record_ingested(Modality::Cdr);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains(r#""cdr":1"#));
    }
}
