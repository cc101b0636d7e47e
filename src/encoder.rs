//! Snapshot encoding
//!
//! Wraps fused snapshots in the `mobility.fused_snapshot.v1` envelope with
//! producer metadata and a small quality summary, for NDJSON output and
//! consumers that want self-describing records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FusionError;
use crate::types::FusedSnapshot;
use crate::{FLUX_VERSION, PRODUCER_NAME};

/// Current output schema version
pub const SNAPSHOT_SCHEMA_VERSION: &str = "mobility.fused_snapshot.v1";

/// Producer metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotProducer {
    pub name: String,
    pub version: String,
    pub instance_id: String,
}

/// Quality summary of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotQuality {
    /// Seconds between the window end and the snapshot generation
    pub freshness_sec: i64,
    pub confidence: f64,
    pub modality_count: usize,
    pub evidence_count: usize,
}

/// Self-describing snapshot record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub schema_version: String,
    pub producer: SnapshotProducer,
    pub encoded_at_utc: DateTime<Utc>,
    pub quality: SnapshotQuality,
    pub snapshot: FusedSnapshot,
}

/// Encoder for fused snapshots
#[derive(Debug, Clone)]
pub struct SnapshotEncoder {
    instance_id: String,
}

impl Default for SnapshotEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotEncoder {
    /// Create a new encoder with a unique instance ID
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create an encoder with a specific instance ID
    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn encode(&self, snapshot: &FusedSnapshot) -> SnapshotEnvelope {
        SnapshotEnvelope {
            schema_version: SNAPSHOT_SCHEMA_VERSION.to_string(),
            producer: SnapshotProducer {
                name: PRODUCER_NAME.to_string(),
                version: FLUX_VERSION.to_string(),
                instance_id: self.instance_id.clone(),
            },
            encoded_at_utc: Utc::now(),
            quality: SnapshotQuality {
                freshness_sec: (snapshot.generated_at - snapshot.window_end).num_seconds(),
                confidence: snapshot.entity_confidence,
                modality_count: snapshot.contributing_modalities.len(),
                evidence_count: snapshot.evidence_count,
            },
            snapshot: snapshot.clone(),
        }
    }

    /// Encode to a single-line JSON string
    pub fn encode_to_json(&self, snapshot: &FusedSnapshot) -> Result<String, FusionError> {
        Ok(serde_json::to_string(&self.encode(snapshot))?)
    }

    /// Encode to pretty-printed JSON
    pub fn encode_to_json_pretty(&self, snapshot: &FusedSnapshot) -> Result<String, FusionError> {
        Ok(serde_json::to_string_pretty(&self.encode(snapshot))?)
    }
}
