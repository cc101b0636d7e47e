//! Mobility Flux - Streaming multi-modal fusion engine for urban mobility
//!
//! Flux fuses GPS fixes, call-detail records and wireless probe sightings into
//! per-entity trajectories through a staged pipeline: modality normalization →
//! entity resolution → event-time windowing → deterministic fusion → snapshot
//! dispatch.
//!
//! ## Entry points
//!
//! - **[`FluxEngine`]**: concurrent runtime with per-modality intakes, sharded
//!   entity resolution and per-consumer delivery with retry
//! - **[`FluxProcessor`]**: the same stages in-line, for batch files and
//!   deterministic replays

pub mod adapters;
pub mod confidence;
pub mod config;
pub mod dispatch;
pub mod encoder;
pub mod error;
pub mod fusion;
pub mod geo;
pub mod metrics;
pub mod normalizer;
pub mod pipeline;
pub mod resolver;
pub mod schema;
pub mod shard;
pub mod types;
pub mod window;

pub use config::{FusionConfig, LatePolicy};
pub use dispatch::{ChannelConsumer, DeliveryError, DispatchFailure, NdjsonConsumer, SnapshotConsumer};
pub use encoder::{SnapshotEncoder, SNAPSHOT_SCHEMA_VERSION};
pub use error::FusionError;
pub use metrics::MetricsSnapshot;
pub use pipeline::{fuse_ndjson, FluxEngine, FluxProcessor, ModalityIntake};
pub use types::{EntityId, FusedSnapshot, Modality, PositionalEvidence, SnapshotKind};

// Schema exports
pub use schema::{RawEvent, RawEventAdapter, SCHEMA_VERSION};

/// Flux version embedded in every snapshot envelope
pub const FLUX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for snapshot envelopes
pub const PRODUCER_NAME: &str = "mobility-flux";
