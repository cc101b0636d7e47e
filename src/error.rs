//! Error types for Mobility Flux

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{EntityId, Modality};

/// Errors that can occur while ingesting, fusing or dispatching mobility evidence
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("Malformed {modality} evidence: {reason}")]
    MalformedEvidence { modality: Modality, reason: String },

    #[error("Window {window_start} of entity {entity_id} has no evidence to fuse")]
    EmptyWindowSkip {
        entity_id: EntityId,
        window_start: DateTime<Utc>,
    },

    #[error("Late evidence for window {window_start} of entity {entity_id} dropped")]
    LateEvidenceDropped {
        entity_id: EntityId,
        window_start: DateTime<Utc>,
    },

    #[error(
        "Delivery of window {window_start} for entity {entity_id} to consumer {consumer_id} \
         exhausted after {attempts} attempts: {last_error}"
    )]
    DispatchExhausted {
        consumer_id: String,
        entity_id: EntityId,
        window_start: DateTime<Utc>,
        attempts: u32,
        last_error: String,
    },

    #[error("Entity {evicted} was evicted while evidence was in flight; continued as {replacement}")]
    EntityEvictionRace {
        evicted: EntityId,
        replacement: EntityId,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse raw event: {0}")]
    ParseError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine is shutting down and no longer accepts events")]
    ShuttingDown,

    #[error("Pipeline channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl FusionError {
    pub(crate) fn malformed(modality: Modality, reason: impl Into<String>) -> Self {
        FusionError::MalformedEvidence {
            modality,
            reason: reason.into(),
        }
    }
}
