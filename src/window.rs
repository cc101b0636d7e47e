//! Evidence windows and watermarks
//!
//! Evidence is buffered per entity into windows aligned to multiples of the
//! window size. A window is ready once the watermark reaches its end, and from
//! then on it never accepts on-time evidence again. Evidence for a closed
//! window is late and handled by the configured [`LatePolicy`].

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::config::{LatePolicy, WindowConfig};
use crate::error::FusionError;
use crate::types::{EntityId, EvidenceWindow, PositionalEvidence};

/// What happened to one piece of admitted evidence
#[derive(Debug)]
pub enum Admission {
    /// Appended to a pending window
    Buffered { window_start: DateTime<Utc> },
    /// Arrived after its window closed and was discarded
    Dropped(FusionError),
    /// Arrived after its window closed; the window was reopened for re-fusion
    Correction(EvidenceWindow),
}

/// (window_end, entity, window_start)
type WindowKey = (DateTime<Utc>, EntityId, DateTime<Utc>);

/// Per-entity window buffers for one shard
#[derive(Debug)]
pub struct WindowManager {
    config: WindowConfig,
    watermark: Option<DateTime<Utc>>,
    pending: HashMap<EntityId, BTreeMap<DateTime<Utc>, EvidenceWindow>>,
    deadlines: BTreeSet<WindowKey>,
    /// Closed windows kept for corrections under `reopen`
    retained: HashMap<EntityId, BTreeMap<DateTime<Utc>, EvidenceWindow>>,
    /// (expiry, entity, window_start)
    retention: BTreeSet<WindowKey>,
}

impl WindowManager {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            watermark: None,
            pending: HashMap::new(),
            deadlines: BTreeSet::new(),
            retained: HashMap::new(),
            retention: BTreeSet::new(),
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// Start of the aligned window containing `timestamp`
    pub fn window_start_for(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let size_ms = self.config.window_size().num_milliseconds().max(1);
        let offset = timestamp.timestamp_millis().rem_euclid(size_ms);
        timestamp - Duration::milliseconds(offset)
    }

    pub fn late_policy(&self) -> LatePolicy {
        self.config.late_policy
    }

    /// Whether evidence at `timestamp` falls into a window the watermark closed
    pub fn is_late(&self, timestamp: DateTime<Utc>) -> bool {
        let window_end = self.window_start_for(timestamp) + self.config.window_size();
        self.watermark.map_or(false, |wm| window_end <= wm)
    }

    /// Whether the closed window of `entity_id` covering `timestamp` can still
    /// take a correction
    pub fn is_retained(&self, entity_id: EntityId, timestamp: DateTime<Utc>) -> bool {
        let window_start = self.window_start_for(timestamp);
        self.retained
            .get(&entity_id)
            .map_or(false, |windows| windows.contains_key(&window_start))
    }

    /// Buffer evidence resolved to `entity_id`
    pub fn admit(&mut self, entity_id: EntityId, evidence: PositionalEvidence) -> Admission {
        let window_start = self.window_start_for(evidence.timestamp);
        let window_end = window_start + self.config.window_size();

        if self.is_late(evidence.timestamp) {
            return self.admit_late(entity_id, window_start, evidence);
        }

        let window = self
            .pending
            .entry(entity_id)
            .or_default()
            .entry(window_start)
            .or_insert_with(|| EvidenceWindow::new(entity_id, window_start, window_end));
        let opened = window.evidence.is_empty();
        window.evidence.push(evidence);

        if opened {
            self.deadlines.insert((window_end, entity_id, window_start));
        }
        Admission::Buffered { window_start }
    }

    fn admit_late(
        &mut self,
        entity_id: EntityId,
        window_start: DateTime<Utc>,
        evidence: PositionalEvidence,
    ) -> Admission {
        if self.config.late_policy == LatePolicy::Reopen {
            let watermark = self.watermark;
            if let Some(window) = self
                .retained
                .get_mut(&entity_id)
                .and_then(|windows| windows.get_mut(&window_start))
            {
                window.evidence.push(evidence);
                window.revision += 1;
                window.watermark = watermark;
                debug!(
                    entity_id = %entity_id,
                    window_start = %window_start,
                    revision = window.revision,
                    "reopened closed window for late evidence"
                );
                return Admission::Correction(window.clone());
            }
        }

        debug!(
            entity_id = %entity_id,
            window_start = %window_start,
            modality = %evidence.modality,
            "dropping late evidence"
        );
        Admission::Dropped(FusionError::LateEvidenceDropped {
            entity_id,
            window_start,
        })
    }

    /// Move the watermark forward and return every window it closed,
    /// ordered by window end then entity.
    ///
    /// The watermark never moves backwards; a stale value is ignored.
    pub fn advance(&mut self, watermark: DateTime<Utc>) -> Vec<EvidenceWindow> {
        if self.watermark.map_or(false, |current| watermark <= current) {
            return Vec::new();
        }
        self.watermark = Some(watermark);

        let mut ready = Vec::new();
        while let Some(key) = self.deadlines.iter().next().copied() {
            if key.0 > watermark {
                break;
            }
            self.deadlines.remove(&key);
            if let Some(window) = self.take_pending(key.1, key.2) {
                ready.push(self.seal(window));
            }
        }

        while let Some(key) = self.retention.iter().next().copied() {
            if key.0 > watermark {
                break;
            }
            self.retention.remove(&key);
            self.release(key.1, key.2);
        }

        ready
    }

    /// Close every pending window of one entity, oldest first
    pub fn close_entity(&mut self, entity_id: EntityId) -> Vec<EvidenceWindow> {
        let windows = self.pending.remove(&entity_id).unwrap_or_default();
        self.retained.remove(&entity_id);
        self.retention.retain(|key| key.1 != entity_id);

        let mut closed = Vec::with_capacity(windows.len());
        for mut window in windows.into_values() {
            self.deadlines
                .remove(&(window.window_end, entity_id, window.window_start));
            window.watermark = self.watermark;
            closed.push(window);
        }
        closed
    }

    /// Close every pending window, ordered by window end then entity.
    ///
    /// Nothing is retained for corrections afterwards.
    pub fn flush_all(&mut self) -> Vec<EvidenceWindow> {
        let deadlines = std::mem::take(&mut self.deadlines);
        let mut flushed = Vec::with_capacity(deadlines.len());
        for (_, entity_id, window_start) in deadlines {
            if let Some(mut window) = self.take_pending(entity_id, window_start) {
                window.watermark = self.watermark;
                flushed.push(window);
            }
        }

        self.pending.clear();
        self.retained.clear();
        self.retention.clear();
        flushed
    }

    pub fn pending_count(&self) -> usize {
        self.deadlines.len()
    }

    pub fn retained_count(&self) -> usize {
        self.retention.len()
    }

    fn take_pending(
        &mut self,
        entity_id: EntityId,
        window_start: DateTime<Utc>,
    ) -> Option<EvidenceWindow> {
        let windows = self.pending.get_mut(&entity_id)?;
        let window = windows.remove(&window_start);
        if windows.is_empty() {
            self.pending.remove(&entity_id);
        }
        window
    }

    fn seal(&mut self, mut window: EvidenceWindow) -> EvidenceWindow {
        window.watermark = self.watermark;
        if self.config.late_policy == LatePolicy::Reopen {
            let expiry =
                window.window_end + Duration::seconds(self.config.correction_horizon_secs);
            self.retention
                .insert((expiry, window.entity_id, window.window_start));
            self.retained
                .entry(window.entity_id)
                .or_default()
                .insert(window.window_start, window.clone());
        }
        window
    }

    fn release(&mut self, entity_id: EntityId, window_start: DateTime<Utc>) {
        if let Some(windows) = self.retained.get_mut(&entity_id) {
            windows.remove(&window_start);
            if windows.is_empty() {
                self.retained.remove(&entity_id);
            }
        }
    }
}
