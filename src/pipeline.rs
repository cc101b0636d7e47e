//! Pipeline orchestration
//!
//! This module provides the public API for Mobility Flux. It wires the stages
//! together in two shapes:
//!
//! - [`FluxEngine`]: the concurrent runtime. Per-modality intakes feed
//!   normalizer tasks, an ingest router assigns evidence to resolver shards and
//!   derives the watermark, shards hand ready windows to fusion workers, and a
//!   dispatcher fans snapshots out to consumers. Stages are connected by
//!   bounded queues, so a slow stage pushes back on producers.
//! - [`FluxProcessor`]: the same stages run in-line on one shard, for batch
//!   files and deterministic processing.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FusionConfig;
use crate::dispatch::{DispatchFailure, DispatchRouter, SnapshotConsumer};
use crate::error::FusionError;
use crate::fusion::FusionEngine;
use crate::geo::GridCell;
use crate::metrics::{FluxMetrics, MetricsSnapshot};
use crate::normalizer::Normalizer;
use crate::schema::{RawEvent, RawEventAdapter};
use crate::shard::{Shard, ShardInput};
use crate::types::{EntityId, EvidenceWindow, FusedSnapshot, Modality, PositionalEvidence, SnapshotKind};

/// Fuse a batch of NDJSON raw events in one shot.
///
/// Records that fail normalization are skipped and counted; unparseable JSON
/// fails the whole batch.
///
/// # Example
/// ```ignore
/// let snapshots = fuse_ndjson(&std::fs::read_to_string("events.ndjson")?, FusionConfig::default())?;
/// ```
pub fn fuse_ndjson(input: &str, config: FusionConfig) -> Result<Vec<FusedSnapshot>, FusionError> {
    let events = RawEventAdapter::parse_ndjson(input)?;
    let mut processor = FluxProcessor::new(config)?;

    let mut snapshots = Vec::new();
    for event in &events {
        match processor.process(event) {
            Ok(mut fused) => snapshots.append(&mut fused),
            Err(FusionError::MalformedEvidence { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    snapshots.append(&mut processor.finish());
    Ok(snapshots)
}

/// Synchronous processor running every stage in-line on a single shard
pub struct FluxProcessor {
    normalizer: Normalizer,
    shard: Shard,
    fusion: FusionEngine,
    metrics: Arc<FluxMetrics>,
    lateness: Duration,
    max_seen: Option<DateTime<Utc>>,
}

impl FluxProcessor {
    pub fn new(config: FusionConfig) -> Result<Self, FusionError> {
        config.validate()?;
        let metrics = Arc::new(FluxMetrics::new());
        Ok(Self {
            normalizer: Normalizer::new(config.normalizer.clone()),
            shard: Shard::new(0, &config, metrics.clone()),
            fusion: FusionEngine::new(),
            metrics,
            lateness: config.window.allowed_lateness(),
            max_seen: None,
        })
    }

    /// Process one raw event, returning every snapshot it completed.
    ///
    /// A malformed record is counted and returned as an error; the processor
    /// stays usable.
    pub fn process(&mut self, raw: &RawEvent) -> Result<Vec<FusedSnapshot>, FusionError> {
        let evidence = match self.normalizer.normalize(raw, Utc::now()) {
            Ok(evidence) => evidence,
            Err(e) => {
                self.metrics.record_malformed();
                return Err(e);
            }
        };
        self.metrics.record_ingested(evidence.modality);

        let timestamp = evidence.timestamp;
        let mut ready = self.shard.ingest(evidence);
        if self.max_seen.map_or(true, |seen| timestamp > seen) {
            self.max_seen = Some(timestamp);
            ready.append(&mut self.shard.advance(timestamp - self.lateness));
        }

        Ok(fuse_windows(&self.fusion, &self.metrics, ready))
    }

    /// Flush every open window
    pub fn finish(&mut self) -> Vec<FusedSnapshot> {
        let flushed = self.shard.drain();
        fuse_windows(&self.fusion, &self.metrics, flushed)
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.shard.windows().watermark()
    }

    pub fn active_entities(&self) -> usize {
        self.shard.resolver().active_count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn fuse_windows(
    fusion: &FusionEngine,
    metrics: &FluxMetrics,
    windows: Vec<EvidenceWindow>,
) -> Vec<FusedSnapshot> {
    windows
        .iter()
        .filter_map(|window| fuse_window(fusion, metrics, window))
        .collect()
}

fn fuse_window(
    fusion: &FusionEngine,
    metrics: &FluxMetrics,
    window: &EvidenceWindow,
) -> Option<FusedSnapshot> {
    match fusion.fuse(window) {
        Ok(snapshot) => {
            metrics.record_window_fused();
            if snapshot.kind == SnapshotKind::Correction {
                metrics.record_correction();
            }
            Some(snapshot)
        }
        Err(FusionError::EmptyWindowSkip {
            entity_id,
            window_start,
        }) => {
            metrics.record_empty_window();
            debug!(entity_id = %entity_id, window_start = %window_start, "Skipped empty window");
            None
        }
        Err(e) => {
            warn!(entity_id = %window.entity_id, error = %e, "Fusion failed");
            None
        }
    }
}

/// Producer handle for one modality's intake queue
#[derive(Clone)]
pub struct ModalityIntake {
    modality: Modality,
    sender: mpsc::Sender<RawEvent>,
    accepting: Arc<AtomicBool>,
    metrics: Arc<FluxMetrics>,
}

impl ModalityIntake {
    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// Submit one raw record, waiting while the intake queue is full
    pub async fn submit(&self, raw: RawEvent) -> Result<(), FusionError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(FusionError::ShuttingDown);
        }
        if raw.modality() != self.modality {
            self.metrics.record_malformed();
            return Err(FusionError::malformed(
                raw.modality(),
                format!("submitted on the {} intake", self.modality),
            ));
        }
        self.sender
            .send(raw)
            .await
            .map_err(|_| FusionError::ShuttingDown)
    }
}

/// Concurrent staged fusion runtime
pub struct FluxEngine {
    config: Arc<FusionConfig>,
    intakes: BTreeMap<Modality, mpsc::Sender<RawEvent>>,
    accepting: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    dispatch: Arc<DispatchRouter>,
    metrics: Arc<FluxMetrics>,
    reports: Mutex<mpsc::Receiver<DispatchFailure>>,
    stages: Vec<(&'static str, JoinHandle<()>)>,
}

impl FluxEngine {
    /// Validate the configuration and spawn every stage.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: FusionConfig) -> Result<Self, FusionError> {
        config.validate()?;
        let config = Arc::new(config);
        let runtime = &config.runtime;
        let metrics = Arc::new(FluxMetrics::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (dispatch, reports) = DispatchRouter::new(config.dispatch.clone(), metrics.clone());
        let dispatch = Arc::new(dispatch);
        let mut stages = Vec::new();

        // dispatcher
        let (snapshot_tx, snapshot_rx) = mpsc::channel(runtime.stage_capacity);
        stages.push((
            "dispatcher",
            tokio::spawn(run_dispatcher(snapshot_rx, dispatch.clone())),
        ));

        // fusion workers
        let mut fusion_txs = Vec::with_capacity(runtime.fusion_workers);
        for worker in 0..runtime.fusion_workers {
            let (tx, rx) = mpsc::channel(runtime.stage_capacity);
            fusion_txs.push(tx);
            stages.push((
                "fusion",
                tokio::spawn(run_fusion_worker(worker, rx, snapshot_tx.clone(), metrics.clone())),
            ));
        }
        drop(snapshot_tx);

        // resolver shards
        let mut shard_txs = Vec::with_capacity(runtime.resolver_shards);
        for id in 0..runtime.resolver_shards {
            let (tx, rx) = mpsc::channel(runtime.stage_capacity);
            shard_txs.push(tx);
            let shard = Shard::new(id, &config, metrics.clone());
            stages.push((
                "shard",
                tokio::spawn(run_shard(shard, rx, fusion_txs.clone())),
            ));
        }
        drop(fusion_txs);

        // ingest router
        let (evidence_tx, evidence_rx) = mpsc::channel(runtime.stage_capacity);
        stages.push((
            "router",
            tokio::spawn(run_router(IngestRouter::new(&config), evidence_rx, shard_txs)),
        ));

        // normalizers
        let mut intakes = BTreeMap::new();
        for modality in Modality::ALL {
            let (tx, rx) = mpsc::channel(runtime.intake_capacity);
            intakes.insert(modality, tx);
            stages.push((
                "normalizer",
                tokio::spawn(run_normalizer(
                    modality,
                    Normalizer::new(config.normalizer.clone()),
                    rx,
                    evidence_tx.clone(),
                    shutdown_rx.clone(),
                    metrics.clone(),
                )),
            ));
        }
        drop(evidence_tx);

        info!(
            shards = runtime.resolver_shards,
            fusion_workers = runtime.fusion_workers,
            window_size_secs = config.window.window_size_secs,
            late_policy = ?config.window.late_policy,
            "Flux engine started"
        );

        Ok(Self {
            config,
            intakes,
            accepting: Arc::new(AtomicBool::new(true)),
            shutdown,
            dispatch,
            metrics,
            reports: Mutex::new(reports),
            stages,
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Producer handle for one modality
    pub fn intake(&self, modality: Modality) -> Result<ModalityIntake, FusionError> {
        let sender = self
            .intakes
            .get(&modality)
            .cloned()
            .ok_or(FusionError::ChannelClosed("intake"))?;
        Ok(ModalityIntake {
            modality,
            sender,
            accepting: self.accepting.clone(),
            metrics: self.metrics.clone(),
        })
    }

    /// Route a raw record to its modality's intake
    pub async fn submit(&self, raw: RawEvent) -> Result<(), FusionError> {
        self.intake(raw.modality())?.submit(raw).await
    }

    pub async fn register_consumer(
        &self,
        consumer_id: impl Into<String>,
        endpoint: Arc<dyn SnapshotConsumer>,
    ) {
        self.dispatch.register(consumer_id, endpoint).await;
    }

    pub async fn deregister_consumer(&self, consumer_id: &str) -> bool {
        self.dispatch.deregister(consumer_id).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Drain the dispatch failure reports collected so far
    pub async fn take_failure_reports(&self) -> Vec<DispatchFailure> {
        let mut reports = self.reports.lock().await;
        let mut taken = Vec::new();
        while let Ok(report) = reports.try_recv() {
            taken.push(report);
        }
        taken
    }

    /// Stop accepting events, flush every open window through fusion and
    /// dispatch, then stop all stages.
    pub async fn shutdown(self) -> MetricsSnapshot {
        self.accepting.store(false, Ordering::Release);
        // Normalizers close their queues on this signal and drain what is buffered.
        let _ = self.shutdown.send(true);
        drop(self.intakes);

        for (stage, handle) in self.stages {
            if let Err(e) = handle.await {
                warn!(stage, error = %e, "Stage task failed");
            }
        }
        self.dispatch.shutdown().await;

        let metrics = self.metrics.snapshot();
        info!(
            ingested = metrics.total_ingested(),
            windows_fused = metrics.windows_fused,
            late_dropped = metrics.late_dropped,
            dispatch_failures = metrics.dispatch_failures,
            "Flux engine stopped"
        );
        metrics
    }
}

async fn run_normalizer(
    modality: Modality,
    normalizer: Normalizer,
    mut intake: mpsc::Receiver<RawEvent>,
    output: mpsc::Sender<PositionalEvidence>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<FluxMetrics>,
) {
    let mut closing = false;
    loop {
        tokio::select! {
            next = intake.recv() => {
                let Some(raw) = next else { break };
                match normalizer.normalize(&raw, Utc::now()) {
                    Ok(evidence) => {
                        metrics.record_ingested(modality);
                        if output.send(evidence).await.is_err() {
                            warn!(modality = %modality, "Router stopped, normalizer exiting");
                            break;
                        }
                    }
                    Err(e) => {
                        metrics.record_malformed();
                        debug!(modality = %modality, error = %e, "Rejected malformed evidence");
                    }
                }
            }
            _ = shutdown.changed(), if !closing => {
                closing = true;
                intake.close();
            }
        }
    }
    debug!(modality = %modality, "Normalizer stopped");
}

async fn run_router(
    mut router: IngestRouter,
    mut input: mpsc::Receiver<PositionalEvidence>,
    shards: Vec<mpsc::Sender<ShardInput>>,
) {
    'intake: while let Some(evidence) = input.recv().await {
        let timestamp = evidence.timestamp;
        let shard = router.route(&evidence);
        if shards[shard].send(ShardInput::Evidence(evidence)).await.is_err() {
            break;
        }

        if let Some(watermark) = router.observe(timestamp) {
            for tx in &shards {
                if tx.send(ShardInput::Advance(watermark)).await.is_err() {
                    break 'intake;
                }
            }
        }
    }
    debug!(routes = router.routes.len(), "Ingest router stopped");
}

async fn run_shard(
    mut shard: Shard,
    mut input: mpsc::Receiver<ShardInput>,
    fusion: Vec<mpsc::Sender<EvidenceWindow>>,
) {
    while let Some(item) = input.recv().await {
        let ready = shard.handle(item);
        if forward_windows(&fusion, ready).await.is_err() {
            warn!(shard = shard.id(), "Fusion stage stopped, shard exiting");
            return;
        }
    }
    // Input closed: flush everything still open.
    let flushed = shard.drain();
    if forward_windows(&fusion, flushed).await.is_err() {
        warn!(shard = shard.id(), "Fusion stage stopped before shard drained");
    }
}

/// Send windows to fusion workers; an entity always maps to the same worker
async fn forward_windows(
    fusion: &[mpsc::Sender<EvidenceWindow>],
    windows: Vec<EvidenceWindow>,
) -> Result<(), FusionError> {
    for window in windows {
        let worker = worker_for(&window.entity_id, fusion.len());
        fusion[worker]
            .send(window)
            .await
            .map_err(|_| FusionError::ChannelClosed("fusion"))?;
    }
    Ok(())
}

fn worker_for(entity_id: &EntityId, workers: usize) -> usize {
    (entity_id.0.as_u128() % workers.max(1) as u128) as usize
}

async fn run_fusion_worker(
    worker: usize,
    mut input: mpsc::Receiver<EvidenceWindow>,
    output: mpsc::Sender<FusedSnapshot>,
    metrics: Arc<FluxMetrics>,
) {
    let fusion = FusionEngine::new();
    while let Some(window) = input.recv().await {
        if let Some(snapshot) = fuse_window(&fusion, &metrics, &window) {
            if output.send(snapshot).await.is_err() {
                warn!(worker, "Dispatcher stopped, fusion worker exiting");
                break;
            }
        }
    }
}

async fn run_dispatcher(mut input: mpsc::Receiver<FusedSnapshot>, router: Arc<DispatchRouter>) {
    while let Some(snapshot) = input.recv().await {
        router.dispatch(snapshot).await;
    }
}

/// Shard placement and watermark tracking for the ingest stage
struct IngestRouter {
    shards: usize,
    cell_deg: f64,
    lateness: Duration,
    broadcast_every: Duration,
    horizon: Duration,
    /// (modality, source) -> (shard, last seen)
    routes: HashMap<(Modality, String), (usize, DateTime<Utc>)>,
    max_seen: Option<DateTime<Utc>>,
    broadcast: Option<DateTime<Utc>>,
}

impl IngestRouter {
    fn new(config: &FusionConfig) -> Self {
        Self {
            shards: config.runtime.resolver_shards.max(1),
            cell_deg: config.runtime.shard_cell_deg,
            lateness: config.window.allowed_lateness(),
            broadcast_every: Duration::milliseconds(config.runtime.watermark_broadcast_ms.max(0)),
            horizon: Duration::seconds(config.entities.inactivity_horizon_secs),
            routes: HashMap::new(),
            max_seen: None,
            broadcast: None,
        }
    }

    /// Shard for this evidence: the source's existing shard, else by coarse cell
    fn route(&mut self, evidence: &PositionalEvidence) -> usize {
        let key = (evidence.modality, evidence.source_id.clone());
        let placed = GridCell::of(evidence.location.point(), self.cell_deg).stable_hash()
            % self.shards as u64;
        let entry = self
            .routes
            .entry(key)
            .or_insert((placed as usize, evidence.timestamp));
        entry.1 = entry.1.max(evidence.timestamp);
        entry.0
    }

    /// Track the maximum timestamp; returns a watermark worth broadcasting
    fn observe(&mut self, timestamp: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.max_seen.map_or(false, |seen| timestamp <= seen) {
            return None;
        }
        self.max_seen = Some(timestamp);

        let watermark = timestamp - self.lateness;
        if self
            .broadcast
            .map_or(false, |last| watermark - last < self.broadcast_every)
        {
            return None;
        }
        self.broadcast = Some(watermark);

        let horizon = self.horizon;
        self.routes
            .retain(|_, (_, seen)| timestamp - *seen <= horizon);
        Some(watermark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, LatePolicy};
    use crate::dispatch::{ChannelConsumer, DeliveryError};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(secs)
    }

    fn config() -> FusionConfig {
        let mut config = FusionConfig::default();
        config.window.window_size_secs = 10;
        config.window.allowed_lateness_secs = 0;
        config.runtime.watermark_broadcast_ms = 0;
        config
    }

    fn gps(secs: i64, lat: f64, lon: f64) -> RawEvent {
        RawEvent::gps("dev-1", at(secs), lat, lon, 5.0)
    }

    struct RejectingConsumer {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl SnapshotConsumer for RejectingConsumer {
        async fn deliver(&self, _snapshot: &FusedSnapshot) -> Result<(), DeliveryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError::Unavailable("endpoint down".to_string()))
        }
    }

    #[test]
    fn test_processor_fuses_two_fixes_into_one_window() {
        let mut processor = FluxProcessor::new(config()).unwrap();
        assert!(processor.process(&gps(0, 40.0, -73.0)).unwrap().is_empty());
        assert!(processor.process(&gps(8, 40.0001, -73.0001)).unwrap().is_empty());

        let snapshots = processor.finish();
        assert_eq!(snapshots.len(), 1);
        let snapshot = &snapshots[0];
        assert_eq!(snapshot.window_start, at(0));
        assert_eq!(snapshot.window_end, at(10));
        assert_eq!(snapshot.evidence_count, 2);
        assert!((snapshot.fused_location.lat - 40.00005).abs() < 1e-9);
        assert!((snapshot.fused_location.lon + 73.00005).abs() < 1e-9);
    }

    #[test]
    fn test_processor_emits_when_watermark_passes() {
        let mut processor = FluxProcessor::new(config()).unwrap();
        processor.process(&gps(0, 40.0, -73.0)).unwrap();
        let emitted = processor.process(&gps(10, 40.0, -73.0)).unwrap();

        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].window_start, at(0));
        assert_eq!(processor.watermark(), Some(at(10)));
    }

    #[test]
    fn test_processor_counts_malformed_and_continues() {
        let mut processor = FluxProcessor::new(config()).unwrap();
        let bad = RawEvent::gps("dev-1", at(0), 95.0, -73.0, 5.0);
        assert!(matches!(
            processor.process(&bad),
            Err(FusionError::MalformedEvidence { .. })
        ));
        processor.process(&gps(1, 40.0, -73.0)).unwrap();

        let metrics = processor.metrics();
        assert_eq!(metrics.malformed_rejected, 1);
        assert_eq!(metrics.ingested(Modality::Gps), 1);
        assert_eq!(processor.finish().len(), 1);
    }

    #[test]
    fn test_processor_rejects_pre_epoch_timestamp_and_continues() {
        let mut processor = FluxProcessor::new(config()).unwrap();
        let ancient = RawEvent::gps("dev-1", DateTime::<Utc>::MIN_UTC, 40.0, -73.0, 5.0);
        assert!(matches!(
            processor.process(&ancient),
            Err(FusionError::MalformedEvidence { .. })
        ));
        assert_eq!(processor.watermark(), None);

        processor.process(&gps(0, 40.0, -73.0)).unwrap();
        let emitted = processor.process(&gps(10, 40.0, -73.0)).unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(processor.metrics().malformed_rejected, 1);
    }

    #[test]
    fn test_late_evidence_does_not_create_entity() {
        let mut processor = FluxProcessor::new(config()).unwrap();
        processor.process(&gps(100, 40.0, -73.0)).unwrap();
        assert!(processor.process(&gps(5, 40.0, -73.0)).unwrap().is_empty());

        let metrics = processor.metrics();
        assert_eq!(metrics.late_dropped, 1);
        assert_eq!(metrics.entities_created, 1);
        assert_eq!(processor.active_entities(), 1);

        let rest = processor.finish();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].evidence_count, 1);
    }

    #[test]
    fn test_late_drop_leaves_emitted_snapshot_untouched() {
        let mut processor = FluxProcessor::new(config()).unwrap();
        processor.process(&gps(2, 40.0, -73.0)).unwrap();
        let emitted = processor.process(&gps(12, 40.0, -73.0)).unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].evidence_count, 1);

        let late = processor.process(&gps(5, 40.0, -73.0)).unwrap();
        assert!(late.is_empty());
        assert_eq!(processor.metrics().late_dropped, 1);

        let rest = processor.finish();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].window_start, at(10));
    }

    #[test]
    fn test_reopen_emits_correction() {
        let mut config = config();
        config.window.late_policy = LatePolicy::Reopen;
        let mut processor = FluxProcessor::new(config).unwrap();

        processor.process(&gps(2, 40.0, -73.0)).unwrap();
        let initial = processor.process(&gps(12, 40.0, -73.0)).unwrap();
        let correction = processor.process(&gps(5, 40.0002, -73.0)).unwrap();

        assert_eq!(correction.len(), 1);
        assert_eq!(correction[0].kind, SnapshotKind::Correction);
        assert_eq!(correction[0].revision, 1);
        assert_eq!(correction[0].window_start, initial[0].window_start);
        assert_eq!(correction[0].entity_id, initial[0].entity_id);
        assert_eq!(correction[0].evidence_count, 2);
        assert_eq!(processor.metrics().corrections_emitted, 1);
    }

    #[test]
    fn test_fuse_ndjson_skips_malformed_records() {
        let input = r#"
{"modality":"gps","device_id":"dev-1","timestamp":"2024-01-15T08:00:00Z","lat":40.0,"lon":-73.0,"accuracy_m":5.0}
{"modality":"gps","device_id":"dev-1","timestamp":"2024-01-15T08:00:08Z","lat":40.0001,"lon":-73.0001,"accuracy_m":5.0}
{"modality":"cdr","subscriber_id":"sub-9","timestamp":"2024-01-15T08:00:04Z","tower_id":"UNKNOWN"}
"#;
        let snapshots = fuse_ndjson(input, config()).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].evidence_count, 2);
    }

    #[test]
    fn test_fuse_ndjson_skips_pre_epoch_record() {
        let input = r#"
{"modality":"gps","device_id":"dev-1","timestamp":"-262143-01-01T00:00:00Z","lat":40.0,"lon":-73.0,"accuracy_m":5.0}
{"modality":"gps","device_id":"dev-1","timestamp":"2024-01-15T08:00:00Z","lat":40.0,"lon":-73.0,"accuracy_m":5.0}
"#;
        let snapshots = fuse_ndjson(input, config()).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].window_start, at(0));
    }

    #[test]
    fn test_processor_rejects_invalid_config() {
        let mut config = config();
        config.window.window_size_secs = 0;
        assert!(matches!(
            FluxProcessor::new(config),
            Err(FusionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_router_is_sticky_per_source() {
        let mut config = config();
        config.runtime.resolver_shards = 8;
        let mut router = IngestRouter::new(&config);
        let normalizer = Normalizer::default();

        let first = normalizer.normalize(&gps(0, 40.0, -73.0), at(0)).unwrap();
        let moved = normalizer.normalize(&gps(60, 40.9, -73.9), at(60)).unwrap();
        let shard = router.route(&first);
        assert_eq!(router.route(&moved), shard);
    }

    #[test]
    fn test_router_watermark_throttled_by_broadcast_interval() {
        let mut config = config();
        config.window.allowed_lateness_secs = 5;
        config.runtime.watermark_broadcast_ms = 2_000;
        let mut router = IngestRouter::new(&config);

        assert_eq!(router.observe(at(10)), Some(at(5)));
        assert_eq!(router.observe(at(11)), None);
        assert_eq!(router.observe(at(9)), None);
        assert_eq!(router.observe(at(12)), Some(at(7)));
    }

    #[tokio::test]
    async fn test_engine_fuses_and_dispatches() {
        let engine = FluxEngine::start(config()).unwrap();
        let (consumer, mut received) = ChannelConsumer::new(16);
        engine.register_consumer("prediction", Arc::new(consumer)).await;

        let intake = engine.intake(Modality::Gps).unwrap();
        intake.submit(gps(0, 40.0, -73.0)).await.unwrap();
        intake.submit(gps(8, 40.0001, -73.0001)).await.unwrap();

        let metrics = engine.shutdown().await;
        let snapshot = received.recv().await.unwrap();
        assert!(received.recv().await.is_none());

        assert_eq!(snapshot.window_start, at(0));
        assert!((snapshot.fused_location.lat - 40.00005).abs() < 1e-9);
        assert!((snapshot.fused_location.lon + 73.00005).abs() < 1e-9);
        assert_eq!(metrics.ingested(Modality::Gps), 2);
        assert_eq!(metrics.windows_fused, 1);
        assert_eq!(metrics.snapshots_delivered, 1);
    }

    #[tokio::test]
    async fn test_engine_without_consumers_still_fuses() {
        let engine = FluxEngine::start(config()).unwrap();
        engine.submit(gps(0, 40.0, -73.0)).await.unwrap();

        let metrics = engine.shutdown().await;
        assert_eq!(metrics.windows_fused, 1);
        assert_eq!(metrics.snapshots_delivered, 0);
        assert_eq!(metrics.dispatch_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_isolates_failing_consumer() {
        let mut config = config();
        config.dispatch.max_retries = 4;
        config.dispatch.backoff = BackoffConfig {
            initial_delay_ms: 10,
            max_delay_ms: 50,
            multiplier: 2.0,
        };
        let engine = FluxEngine::start(config).unwrap();

        let failing = Arc::new(RejectingConsumer {
            attempts: AtomicU32::new(0),
        });
        let (healthy, mut received) = ChannelConsumer::new(16);
        engine.register_consumer("anomaly", failing.clone()).await;
        engine.register_consumer("dashboard", Arc::new(healthy)).await;

        engine.submit(gps(0, 40.0, -73.0)).await.unwrap();
        engine.submit(gps(15, 40.0, -73.0)).await.unwrap();

        // Wait until the first window has been handled by both consumers
        let first = received.recv().await.unwrap();
        assert_eq!(first.window_start, at(0));
        while engine.metrics().dispatch_failures < 1 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let reports = engine.take_failure_reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].consumer_id, "anomaly");
        assert_eq!(reports[0].attempts, 4);

        let metrics = engine.shutdown().await;
        assert_eq!(failing.attempts.load(Ordering::SeqCst), 8);
        assert_eq!(metrics.dispatch_failures, 2);
        assert_eq!(metrics.snapshots_delivered, 2);
        assert!(received.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_engine_counts_late_drops() {
        let engine = FluxEngine::start(config()).unwrap();
        let intake = engine.intake(Modality::Gps).unwrap();
        intake.submit(gps(0, 40.0, -73.0)).await.unwrap();
        intake.submit(gps(25, 40.0, -73.0)).await.unwrap();
        intake.submit(gps(3, 40.0, -73.0)).await.unwrap();

        let metrics = engine.shutdown().await;
        assert_eq!(metrics.late_dropped, 1);
        assert_eq!(metrics.windows_fused, 2);
    }

    #[tokio::test]
    async fn test_engine_survives_pre_epoch_timestamp() {
        let engine = FluxEngine::start(config()).unwrap();
        engine
            .submit(RawEvent::gps("dev-1", DateTime::<Utc>::MIN_UTC, 40.0, -73.0, 5.0))
            .await
            .unwrap();
        engine.submit(gps(0, 40.0, -73.0)).await.unwrap();

        let metrics = engine.shutdown().await;
        assert_eq!(metrics.malformed_rejected, 1);
        assert_eq!(metrics.ingested(Modality::Gps), 1);
        assert_eq!(metrics.windows_fused, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_engine_multi_source_delivers_each_window_once() {
        let mut config = config();
        config.window.allowed_lateness_secs = 30;
        config.runtime.resolver_shards = 4;
        config.runtime.fusion_workers = 3;
        config.dispatch.consumer_queue_capacity = 4_096;
        let engine = FluxEngine::start(config).unwrap();
        let (consumer, mut received) = ChannelConsumer::new(4_096);
        engine.register_consumer("prediction", Arc::new(consumer)).await;

        // Sources half a degree apart never match each other and spread over shard cells
        let mut events = Vec::new();
        for step in 0..30 {
            let secs = step * 4;
            for i in 0..6 {
                let lat = 40.0 + 0.5 * i as f64;
                events.push(RawEvent::gps(format!("dev-{i}"), at(secs), lat, -73.0, 5.0));
            }
            for i in 0..3 {
                let lat = 44.0 + 0.5 * i as f64;
                events.push(RawEvent::cdr(format!("sub-{i}"), at(secs), lat, -72.0, Some(-80.0)));
            }
            for i in 0..3 {
                let lat = 46.0 + 0.5 * i as f64;
                events.push(RawEvent::probe(format!("{i:02x}ff"), at(secs), lat, -71.0, Some(-60.0)));
            }
        }
        let submitted = events.len() as u64;

        let mut handles = Vec::new();
        for modality in [Modality::Gps, Modality::Cdr, Modality::Probe] {
            let intake = engine.intake(modality).unwrap();
            let batch: Vec<RawEvent> = events
                .iter()
                .filter(|event| event.modality() == modality)
                .cloned()
                .collect();
            handles.push(tokio::spawn(async move {
                for event in batch {
                    intake.submit(event).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let metrics = engine.shutdown().await;
        let mut snapshots = Vec::new();
        while let Some(snapshot) = received.recv().await {
            snapshots.push(snapshot);
        }

        let fused: u64 = snapshots.iter().map(|s| s.evidence_count as u64).sum();
        assert_eq!(metrics.total_ingested(), submitted);
        assert_eq!(metrics.malformed_rejected, 0);
        assert_eq!(fused + metrics.late_dropped, submitted);
        assert_eq!(metrics.snapshots_delivered, snapshots.len() as u64);

        let mut keys: Vec<_> = snapshots.iter().map(|s| s.fusion_key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), snapshots.len());
    }

    #[tokio::test]
    async fn test_intake_rejects_after_shutdown_and_wrong_modality() {
        let engine = FluxEngine::start(config()).unwrap();
        let intake = engine.intake(Modality::Cdr).unwrap();

        let wrong = intake.submit(gps(0, 40.0, -73.0)).await;
        assert!(matches!(wrong, Err(FusionError::MalformedEvidence { .. })));

        engine.shutdown().await;
        let after = intake
            .submit(RawEvent::cdr("sub-1", at(0), 40.0, -73.0, Some(-80.0)))
            .await;
        assert!(matches!(after, Err(FusionError::ShuttingDown)));
    }
}
