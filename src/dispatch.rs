//! Snapshot dispatch
//!
//! The router maps consumer ids to delivery endpoints. Each registered
//! consumer gets its own bounded queue and worker task, and dispatch never
//! waits on a queue, so a slow or failing consumer never delays the others.
//! Delivery is at-least-once: an attempt that errors or times out is retried
//! with exponential backoff until the retry budget is spent, then the failure
//! is reported and the snapshot is discarded for that consumer only. A
//! consumer whose queue is full when a snapshot is dispatched misses that
//! snapshot and gets a failure report with zero attempts.
//!
//! Consumers see snapshots in the order they were dispatched, which keeps
//! per-entity `window_start` order. A consumer registered after a snapshot
//! was dispatched never receives it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::DispatchConfig;
use crate::encoder::SnapshotEncoder;
use crate::error::FusionError;
use crate::metrics::FluxMetrics;
use crate::types::{EntityId, FusedSnapshot};

/// Error returned by a consumer endpoint for one delivery attempt
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("consumer rejected snapshot: {0}")]
    Rejected(String),

    #[error("consumer unavailable: {0}")]
    Unavailable(String),

    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Delivery capability of a downstream consumer.
///
/// Returning `Ok` acknowledges the snapshot.
#[async_trait]
pub trait SnapshotConsumer: Send + Sync {
    async fn deliver(&self, snapshot: &FusedSnapshot) -> Result<(), DeliveryError>;
}

/// Report of a snapshot a consumer never acknowledged
#[derive(Debug, Clone, Serialize)]
pub struct DispatchFailure {
    pub consumer_id: String,
    pub entity_id: EntityId,
    pub window_start: DateTime<Utc>,
    pub revision: u32,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

impl DispatchFailure {
    pub fn to_error(&self) -> FusionError {
        FusionError::DispatchExhausted {
            consumer_id: self.consumer_id.clone(),
            entity_id: self.entity_id,
            window_start: self.window_start,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
        }
    }
}

struct ConsumerHandle {
    sender: mpsc::Sender<Arc<FusedSnapshot>>,
    worker: JoinHandle<()>,
}

/// Routes fused snapshots to every registered consumer
pub struct DispatchRouter {
    config: DispatchConfig,
    consumers: RwLock<HashMap<String, ConsumerHandle>>,
    metrics: Arc<FluxMetrics>,
    reports: mpsc::Sender<DispatchFailure>,
}

impl DispatchRouter {
    /// Create a router and the receiving end of its failure reports
    pub fn new(
        config: DispatchConfig,
        metrics: Arc<FluxMetrics>,
    ) -> (Self, mpsc::Receiver<DispatchFailure>) {
        let (reports, report_rx) = mpsc::channel(config.report_queue_capacity.max(1));
        let router = Self {
            config,
            consumers: RwLock::new(HashMap::new()),
            metrics,
            reports,
        };
        (router, report_rx)
    }

    /// Register a consumer. An existing registration with the same id is
    /// replaced; its worker finishes what was already queued.
    pub async fn register(
        &self,
        consumer_id: impl Into<String>,
        endpoint: Arc<dyn SnapshotConsumer>,
    ) {
        let consumer_id = consumer_id.into();
        let (sender, receiver) = mpsc::channel(self.config.consumer_queue_capacity.max(1));
        let worker = tokio::spawn(run_consumer(
            consumer_id.clone(),
            endpoint,
            receiver,
            self.config.clone(),
            self.metrics.clone(),
            self.reports.clone(),
        ));

        let previous = self
            .consumers
            .write()
            .await
            .insert(consumer_id.clone(), ConsumerHandle { sender, worker });
        if previous.is_some() {
            warn!(consumer_id = %consumer_id, "Consumer re-registered, replacing endpoint");
        } else {
            debug!(consumer_id = %consumer_id, "Consumer registered");
        }
    }

    /// Remove a consumer. Returns false if it was not registered.
    pub async fn deregister(&self, consumer_id: &str) -> bool {
        let removed = self.consumers.write().await.remove(consumer_id);
        debug!(consumer_id = %consumer_id, found = removed.is_some(), "Consumer deregistered");
        removed.is_some()
    }

    /// Queue a snapshot for every currently registered consumer.
    ///
    /// Never waits: a consumer whose queue is full is skipped and reported.
    /// Returns the number of consumers the snapshot was queued for.
    pub async fn dispatch(&self, snapshot: FusedSnapshot) -> usize {
        let mut targets: Vec<(String, mpsc::Sender<Arc<FusedSnapshot>>)> = self
            .consumers
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.sender.clone()))
            .collect();

        if targets.is_empty() {
            debug!(
                entity_id = %snapshot.entity_id,
                window_start = %snapshot.window_start,
                "No consumers registered, snapshot discarded"
            );
            return 0;
        }
        targets.sort_by(|a, b| a.0.cmp(&b.0));

        let snapshot = Arc::new(snapshot);
        let mut queued = 0;
        for (consumer_id, sender) in targets {
            match sender.try_send(snapshot.clone()) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => self.report_overflow(consumer_id, &snapshot),
                Err(TrySendError::Closed(_)) => {
                    warn!(consumer_id = %consumer_id, "Consumer worker stopped, snapshot not queued");
                }
            }
        }
        queued
    }

    fn report_overflow(&self, consumer_id: String, snapshot: &FusedSnapshot) {
        self.metrics.record_dispatch_failure();
        warn!(
            consumer_id = %consumer_id,
            entity_id = %snapshot.entity_id,
            window_start = %snapshot.window_start,
            "Consumer queue full, snapshot discarded for consumer"
        );
        let failure = DispatchFailure {
            consumer_id,
            entity_id: snapshot.entity_id,
            window_start: snapshot.window_start,
            revision: snapshot.revision,
            attempts: 0,
            last_error: "consumer queue full".to_string(),
            failed_at: Utc::now(),
        };
        if let Err(e) = self.reports.try_send(failure) {
            warn!(error = %e, "Failure report not queued");
        }
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }

    pub async fn consumer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.consumers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every consumer queue and wait for queued deliveries to finish
    pub async fn shutdown(&self) {
        let handles: Vec<(String, ConsumerHandle)> =
            self.consumers.write().await.drain().collect();

        for (consumer_id, handle) in handles {
            drop(handle.sender);
            if let Err(e) = handle.worker.await {
                warn!(consumer_id = %consumer_id, error = %e, "Consumer worker panicked");
            }
        }
        debug!("Dispatch router shut down");
    }
}

async fn run_consumer(
    consumer_id: String,
    endpoint: Arc<dyn SnapshotConsumer>,
    mut receiver: mpsc::Receiver<Arc<FusedSnapshot>>,
    config: DispatchConfig,
    metrics: Arc<FluxMetrics>,
    reports: mpsc::Sender<DispatchFailure>,
) {
    while let Some(snapshot) = receiver.recv().await {
        match deliver_with_retry(&consumer_id, endpoint.as_ref(), &snapshot, &config).await {
            Ok(attempts) => {
                metrics.record_delivered();
                if attempts > 1 {
                    debug!(consumer_id = %consumer_id, attempts, "Delivered after retry");
                }
            }
            Err(failure) => {
                metrics.record_dispatch_failure();
                error!(
                    consumer_id = %failure.consumer_id,
                    entity_id = %failure.entity_id,
                    window_start = %failure.window_start,
                    attempts = failure.attempts,
                    error = %failure.last_error,
                    "Dispatch exhausted, snapshot discarded for consumer"
                );
                if let Err(e) = reports.try_send(failure) {
                    warn!(consumer_id = %consumer_id, error = %e, "Failure report not queued");
                }
            }
        }
    }
    debug!(consumer_id = %consumer_id, "Consumer worker stopped");
}

/// Attempt delivery up to `max_retries` times; returns the attempts used
async fn deliver_with_retry(
    consumer_id: &str,
    endpoint: &dyn SnapshotConsumer,
    snapshot: &FusedSnapshot,
    config: &DispatchConfig,
) -> Result<u32, DispatchFailure> {
    let timeout = Duration::from_millis(config.delivery_timeout_ms);
    let max_attempts = config.max_retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let outcome = match tokio::time::timeout(timeout, endpoint.deliver(snapshot)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(timeout)),
        };

        match outcome {
            Ok(()) => return Ok(attempt),
            Err(e) => {
                last_error = e.to_string();
                if attempt < max_attempts {
                    let delay = config.backoff.delay_for(attempt);
                    debug!(
                        consumer_id = %consumer_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(DispatchFailure {
        consumer_id: consumer_id.to_string(),
        entity_id: snapshot.entity_id,
        window_start: snapshot.window_start,
        revision: snapshot.revision,
        attempts: max_attempts,
        last_error,
        failed_at: Utc::now(),
    })
}

/// Consumer that forwards snapshots into a channel
pub struct ChannelConsumer {
    sender: mpsc::Sender<FusedSnapshot>,
}

impl ChannelConsumer {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<FusedSnapshot>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl SnapshotConsumer for ChannelConsumer {
    async fn deliver(&self, snapshot: &FusedSnapshot) -> Result<(), DeliveryError> {
        self.sender
            .send(snapshot.clone())
            .await
            .map_err(|_| DeliveryError::Unavailable("receiver dropped".to_string()))
    }
}

/// Consumer that writes enveloped snapshots as NDJSON
pub struct NdjsonConsumer<W> {
    writer: Mutex<W>,
    encoder: SnapshotEncoder,
}

impl<W: Write + Send> NdjsonConsumer<W> {
    pub fn new(writer: W, encoder: SnapshotEncoder) -> Self {
        Self {
            writer: Mutex::new(writer),
            encoder,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: Write + Send> SnapshotConsumer for NdjsonConsumer<W> {
    async fn deliver(&self, snapshot: &FusedSnapshot) -> Result<(), DeliveryError> {
        let line = self
            .encoder
            .encode_to_json(snapshot)
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}
