//! Batch parsing and validation of raw events
//!
//! Streaming intake accepts one record at a time; this module handles whole
//! files (NDJSON or a JSON array) for batch processing and validation reports.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::FusionError;
use crate::normalizer::Normalizer;
use crate::schema::raw_event::RawEvent;

/// Adapter for parsing raw event batches
pub struct RawEventAdapter;

impl RawEventAdapter {
    /// Parse a JSON string containing an array of RawEvents
    pub fn parse_array(json: &str) -> Result<Vec<RawEvent>, FusionError> {
        let events: Vec<RawEvent> = serde_json::from_str(json)?;
        Ok(events)
    }

    /// Parse one NDJSON line; `None` for blank lines
    pub fn parse_line(line: &str) -> Option<Result<RawEvent, FusionError>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(serde_json::from_str::<RawEvent>(trimmed).map_err(FusionError::from))
    }

    /// Parse NDJSON (newline-delimited JSON) containing RawEvents
    pub fn parse_ndjson(ndjson: &str) -> Result<Vec<RawEvent>, FusionError> {
        let mut events = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            match Self::parse_line(line) {
                None => continue,
                Some(Ok(event)) => events.push(event),
                Some(Err(e)) => {
                    return Err(FusionError::ParseError(format!(
                        "Failed to parse line {}: {}",
                        line_num + 1,
                        e
                    )));
                }
            }
        }
        Ok(events)
    }

    /// Normalize each event and report the ones that would be rejected
    pub fn validate_events(
        events: &[RawEvent],
        normalizer: &Normalizer,
        now: DateTime<Utc>,
    ) -> Vec<ValidationResult> {
        events
            .iter()
            .enumerate()
            .filter_map(|(idx, event)| {
                normalizer
                    .normalize(event, now)
                    .err()
                    .map(|e| ValidationResult {
                        index: idx,
                        event_id: event.event_id().map(str::to_string),
                        modality: event.modality().to_string(),
                        error: e.to_string(),
                    })
            })
            .collect()
    }
}

/// Result of event validation
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub index: usize,
    pub event_id: Option<String>,
    pub modality: String,
    pub error: String,
}
