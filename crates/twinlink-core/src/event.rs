//! Outbound device events and the envelope they travel in
//!
//! Events are serialized as JSON records tagged by `"type"`.

use crate::error::CloudChannelError;
use crate::state::{ErrorFlags, MetricSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";

/// Application property flagging telemetry above the alert threshold
pub const TEMPERATURE_ALERT_PROPERTY: &str = "temperatureAlert";

/// Per-tick production telemetry, carrying counter deltas rather than totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub production_status: String,
    pub workorder_id: String,
    pub temperature: f64,
    pub good_delta: i64,
    pub bad_delta: i64,
    pub temperature_alert: bool,
}

/// Emitted when the device error mask changes between two ticks
///
/// The four flags mark bits that *changed* since the previous mask, not
/// bits that are currently set. A consumer wanting the current state must
/// decode `error_mask` itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub error_mask: i64,
    pub emergency_stop: bool,
    pub power_failure: bool,
    pub sensor_failure: bool,
    #[serde(rename = "unknown")]
    pub unknown_failure: bool,
}

impl ErrorEvent {
    /// Event for a mask moving from `previous` to `current`
    pub fn transition(previous: ErrorFlags, current: ErrorFlags) -> Self {
        let changed = current.changed_since(previous);
        Self {
            error_mask: current.raw(),
            emergency_stop: changed.contains(ErrorFlags::EMERGENCY_STOP),
            power_failure: changed.contains(ErrorFlags::POWER_FAILURE),
            sensor_failure: changed.contains(ErrorFlags::SENSOR_FAILURE),
            unknown_failure: changed.contains(ErrorFlags::UNKNOWN),
        }
    }
}

/// Absolute metric values, sent only by the `SendMessages` diagnostic burst
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub production_status: String,
    pub production_rate: f64,
    pub workorder_id: String,
    pub temperature: f64,
    pub good_count: i64,
    pub bad_count: i64,
    pub device_error: i64,
}

impl From<&MetricSnapshot> for SnapshotRecord {
    fn from(snapshot: &MetricSnapshot) -> Self {
        Self {
            production_status: snapshot.production_status.clone(),
            production_rate: snapshot.production_rate,
            workorder_id: snapshot.workorder_id.clone(),
            temperature: snapshot.temperature,
            good_count: snapshot.good_count,
            bad_count: snapshot.bad_count,
            device_error: snapshot.error_flags.raw(),
        }
    }
}

/// Every record a device publishes on its event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceEvent {
    Telemetry(TelemetryEvent),
    Error(ErrorEvent),
    Snapshot(SnapshotRecord),
}

impl DeviceEvent {
    /// Value of the `"type"` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Telemetry(_) => "telemetry",
            Self::Error(_) => "error",
            Self::Snapshot(_) => "snapshot",
        }
    }

    /// Application properties attached to the envelope
    fn properties(&self) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::new();
        if let Self::Telemetry(telemetry) = self {
            properties.insert(
                TEMPERATURE_ALERT_PROPERTY.to_string(),
                telemetry.temperature_alert.to_string(),
            );
        }
        properties
    }
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Telemetry(t) => write!(
                f,
                "telemetry status={} good+{} bad+{} temp={}{}",
                t.production_status,
                t.good_delta,
                t.bad_delta,
                t.temperature,
                if t.temperature_alert { " ALERT" } else { "" }
            ),
            Self::Error(e) => write!(f, "error mask={:#06b}", e.error_mask),
            Self::Snapshot(s) => write!(
                f,
                "snapshot status={} good={} bad={}",
                s.production_status, s.good_count, s.bad_count
            ),
        }
    }
}

/// Serialized event as handed to the cloud channel
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
    pub properties: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    /// Encode an event as a JSON message
    pub fn encode(event: &DeviceEvent) -> Result<Self, CloudChannelError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| CloudChannelError::new("encode", e.to_string()))?;
        Ok(Self {
            message_id: Uuid::new_v4(),
            created_at: Utc::now(),
            content_type: CONTENT_TYPE_JSON,
            content_encoding: CONTENT_ENCODING_UTF8,
            properties: event.properties(),
            payload,
        })
    }

    /// Decode the payload back into an event
    pub fn decode(&self) -> serde_json::Result<DeviceEvent> {
        serde_json::from_slice(&self.payload)
    }
}
