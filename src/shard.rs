//! Resolver shard
//!
//! A shard owns the entity arena and the pending windows of every entity that
//! lives on it. It is driven by exactly one task, so every mutation of an
//! entity and its windows is serialized without a lock, while shards run in
//! parallel with each other.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::config::{FusionConfig, LatePolicy};
use crate::metrics::FluxMetrics;
use crate::resolver::EntityResolver;
use crate::types::{EvidenceWindow, MobileEntity, PositionalEvidence};
use crate::window::{Admission, WindowManager};

/// Work item for a shard
#[derive(Debug, Clone)]
pub enum ShardInput {
    Evidence(PositionalEvidence),
    /// The global watermark moved forward
    Advance(DateTime<Utc>),
}

/// Entity state and windows of one shard
#[derive(Debug)]
pub struct Shard {
    id: usize,
    resolver: EntityResolver,
    windows: WindowManager,
    metrics: Arc<FluxMetrics>,
}

impl Shard {
    pub fn new(id: usize, config: &FusionConfig, metrics: Arc<FluxMetrics>) -> Self {
        Self {
            id,
            resolver: EntityResolver::from_config(config),
            windows: WindowManager::new(config.window.clone()),
            metrics,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    pub fn windows(&self) -> &WindowManager {
        &self.windows
    }

    /// Apply one input and return the windows now ready for fusion
    pub fn handle(&mut self, input: ShardInput) -> Vec<EvidenceWindow> {
        match input {
            ShardInput::Evidence(evidence) => self.ingest(evidence),
            ShardInput::Advance(watermark) => self.advance(watermark),
        }
    }

    /// Resolve and buffer one piece of evidence.
    ///
    /// Only a reopened window is returned here; on-time evidence becomes
    /// ready when the watermark passes its window. Late evidence that cannot
    /// reopen a retained window is dropped before it reaches the resolver, so
    /// it never creates or moves an entity.
    pub fn ingest(&mut self, evidence: PositionalEvidence) -> Vec<EvidenceWindow> {
        if self.windows.is_late(evidence.timestamp) && !self.reopens(&evidence) {
            self.metrics.record_late_drop();
            debug!(
                shard = self.id,
                modality = %evidence.modality,
                source_id = %evidence.source_id,
                timestamp = %evidence.timestamp,
                "late evidence dropped"
            );
            return Vec::new();
        }

        let resolution = self.resolver.resolve(&evidence);
        if resolution.created {
            self.metrics.record_entity_created();
        }
        if let Some(race) = resolution.eviction_race() {
            self.metrics.record_eviction_race();
            debug!(shard = self.id, error = %race, "eviction race resolved");
        }

        match self.windows.admit(resolution.entity_id, evidence) {
            Admission::Buffered { .. } => Vec::new(),
            Admission::Dropped(late) => {
                self.metrics.record_late_drop();
                debug!(shard = self.id, reason = %late, "late evidence dropped");
                Vec::new()
            }
            Admission::Correction(mut window) => {
                self.stamp_confidence(&mut window, None);
                vec![window]
            }
        }
    }

    /// Advance the watermark: close windows, then evict dormant entities
    pub fn advance(&mut self, watermark: DateTime<Utc>) -> Vec<EvidenceWindow> {
        let mut ready = self.windows.advance(watermark);
        for window in &mut ready {
            self.stamp_confidence(window, None);
        }

        let evicted = self.resolver.evict_dormant(watermark);
        if !evicted.is_empty() {
            self.metrics.record_entities_evicted(evicted.len());
            for entity in &evicted {
                for mut window in self.windows.close_entity(entity.entity_id) {
                    self.stamp_confidence(&mut window, Some(entity));
                    ready.push(window);
                }
            }
        }

        if !ready.is_empty() {
            debug!(
                shard = self.id,
                watermark = %watermark,
                ready = ready.len(),
                active_entities = self.resolver.active_count(),
                "windows ready"
            );
        }
        ready
    }

    /// Close every pending window for shutdown
    pub fn drain(&mut self) -> Vec<EvidenceWindow> {
        let mut flushed = self.windows.flush_all();
        for window in &mut flushed {
            self.stamp_confidence(window, None);
        }
        debug!(shard = self.id, flushed = flushed.len(), "drained shard");
        flushed
    }

    fn reopens(&self, evidence: &PositionalEvidence) -> bool {
        self.windows.late_policy() == LatePolicy::Reopen
            && self
                .resolver
                .peek(evidence)
                .map_or(false, |entity_id| self.windows.is_retained(entity_id, evidence.timestamp))
    }

    fn stamp_confidence(&self, window: &mut EvidenceWindow, evicted: Option<&MobileEntity>) {
        let entity = evicted.or_else(|| self.resolver.get(&window.entity_id));
        window.entity_confidence = entity
            .map(|e| self.resolver.confidence_model().entity_at(e, window.window_end))
            .unwrap_or(0.0);
    }
}
