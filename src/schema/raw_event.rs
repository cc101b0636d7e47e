//! mobility.raw_event.v1 schema definition
//!
//! One record per line, tagged by `modality`:
//! - `gps`: device positioning fixes with coordinates
//! - `cdr`: call-detail records referencing a serving cell tower
//! - `probe`: wireless probe-request sightings at a fixed sensor
//!
//! Fields that the normalizer requires are still `Option` here so that a
//! record with missing data parses and is rejected with a precise reason.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Modality;

/// Current schema version
pub const SCHEMA_VERSION: &str = "mobility.raw_event.v1";

/// Satellite positioning fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub device_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "latitude")]
    pub lat: Option<f64>,
    #[serde(default, alias = "longitude")]
    pub lon: Option<f64>,
    /// Horizontal accuracy reported by the receiver (meters)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kmph: Option<f64>,
}

/// Kind of network activity that produced a CDR
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CdrEventType {
    CallStart,
    CallEnd,
    SmsSend,
    SmsRecv,
    Data,
    #[serde(untagged)]
    Other(String),
}

/// Cellular call-detail record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallDetailRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(alias = "user_id")]
    pub subscriber_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Serving cell identifier, resolved through the anchor registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tower_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tower_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tower_lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_dbm: Option<f64>,
    /// Bearing of the serving sector (degrees from north)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_azimuth_deg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<CdrEventType>,
}

/// Wireless probe-request sighting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSighting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Hashed (possibly randomized) MAC address of the probing device
    pub device_hash: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Capturing sensor identifier, resolved through the anchor registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi_dbm: Option<f64>,
}

/// The main mobility.raw_event.v1 envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "modality", rename_all = "lowercase")]
pub enum RawEvent {
    Gps(GpsFix),
    Cdr(CallDetailRecord),
    Probe(ProbeSighting),
}

impl RawEvent {
    pub fn modality(&self) -> Modality {
        match self {
            RawEvent::Gps(_) => Modality::Gps,
            RawEvent::Cdr(_) => Modality::Cdr,
            RawEvent::Probe(_) => Modality::Probe,
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        match self {
            RawEvent::Gps(fix) => fix.event_id.as_deref(),
            RawEvent::Cdr(cdr) => cdr.event_id.as_deref(),
            RawEvent::Probe(probe) => probe.event_id.as_deref(),
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            RawEvent::Gps(fix) => &fix.device_id,
            RawEvent::Cdr(cdr) => &cdr.subscriber_id,
            RawEvent::Probe(probe) => &probe.device_hash,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            RawEvent::Gps(fix) => fix.timestamp,
            RawEvent::Cdr(cdr) => cdr.timestamp,
            RawEvent::Probe(probe) => probe.timestamp,
        }
    }

    /// Create a GPS event
    pub fn gps(
        device_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        lat: f64,
        lon: f64,
        accuracy_m: f64,
    ) -> Self {
        RawEvent::Gps(GpsFix {
            event_id: None,
            device_id: device_id.into(),
            timestamp: Some(timestamp),
            lat: Some(lat),
            lon: Some(lon),
            accuracy_m: Some(accuracy_m),
            speed_kmph: None,
        })
    }

    /// Create a CDR event served by a tower at a known position
    pub fn cdr(
        subscriber_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        tower_lat: f64,
        tower_lon: f64,
        signal_dbm: Option<f64>,
    ) -> Self {
        RawEvent::Cdr(CallDetailRecord {
            event_id: None,
            subscriber_id: subscriber_id.into(),
            timestamp: Some(timestamp),
            tower_id: None,
            tower_lat: Some(tower_lat),
            tower_lon: Some(tower_lon),
            signal_dbm,
            sector_azimuth_deg: None,
            event_type: None,
        })
    }

    /// Create a probe sighting at a sensor with a known position
    pub fn probe(
        device_hash: impl Into<String>,
        timestamp: DateTime<Utc>,
        sensor_lat: f64,
        sensor_lon: f64,
        rssi_dbm: Option<f64>,
    ) -> Self {
        RawEvent::Probe(ProbeSighting {
            event_id: None,
            device_hash: device_hash.into(),
            timestamp: Some(timestamp),
            sensor_id: None,
            sensor_lat: Some(sensor_lat),
            sensor_lon: Some(sensor_lon),
            rssi_dbm,
        })
    }

    /// Attach an event identifier
    pub fn with_event_id(mut self, id: impl Into<String>) -> Self {
        let id = Some(id.into());
        match &mut self {
            RawEvent::Gps(fix) => fix.event_id = id,
            RawEvent::Cdr(cdr) => cdr.event_id = id,
            RawEvent::Probe(probe) => probe.event_id = id,
        }
        self
    }
}
