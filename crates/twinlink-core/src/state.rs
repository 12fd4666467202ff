//! Per-device observed state and the diff between successive polls

use crate::device::Metric;
use crate::event::{ErrorEvent, TelemetryEvent};
use crate::twin::TwinPatch;
use crate::value::NodeValue;
use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Error bits reported by the `DeviceError` node
    ///
    /// Bits above the four known flags are retained so that a change in
    /// them still counts as a mask change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ErrorFlags: u32 {
        const EMERGENCY_STOP = 0b0001;
        const POWER_FAILURE = 0b0010;
        const SENSOR_FAILURE = 0b0100;
        const UNKNOWN = 0b1000;
    }
}

impl ErrorFlags {
    /// Interpret a raw `DeviceError` reading, keeping every bit
    ///
    /// `None` when the reading does not fit the 32-bit mask.
    pub fn from_raw(raw: i64) -> Option<Self> {
        u32::try_from(raw).ok().map(Self::from_bits_retain)
    }

    /// Raw mask as published upstream
    pub fn raw(self) -> i64 {
        i64::from(self.bits())
    }

    /// Bits that differ between two readings
    pub fn changed_since(self, previous: Self) -> Self {
        self ^ previous
    }
}

/// One read of every snapshot metric, decoded in [`Metric::SNAPSHOT`] order
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    pub production_status: String,
    pub production_rate: f64,
    pub workorder_id: String,
    pub temperature: f64,
    pub good_count: i64,
    pub bad_count: i64,
    pub error_flags: ErrorFlags,
}

/// Why a set of node values could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("expected {expected} values, got {got}")]
    Shape { expected: usize, got: usize },

    #[error("{metric}: {detail}")]
    Value { metric: Metric, detail: String },
}

impl DecodeError {
    /// Metric whose value was rejected, if the shape was right
    pub fn metric(&self) -> Option<Metric> {
        match self {
            Self::Shape { .. } => None,
            Self::Value { metric, .. } => Some(*metric),
        }
    }
}

fn number(metric: Metric, value: &NodeValue) -> Result<f64, DecodeError> {
    value.as_f64().ok_or_else(|| DecodeError::Value {
        metric,
        detail: format!("expected a number, got {}", value.type_name()),
    })
}

fn integer(metric: Metric, value: &NodeValue) -> Result<i64, DecodeError> {
    value.as_i64().ok_or_else(|| DecodeError::Value {
        metric,
        detail: format!("expected an integer, got {} '{value}'", value.type_name()),
    })
}

fn error_mask(value: &NodeValue) -> Result<ErrorFlags, DecodeError> {
    let raw = integer(Metric::DeviceError, value)?;
    ErrorFlags::from_raw(raw).ok_or_else(|| DecodeError::Value {
        metric: Metric::DeviceError,
        detail: format!("mask {raw} outside 0..=4294967295"),
    })
}

fn expect_len(values: &[NodeValue], expected: usize) -> Result<(), DecodeError> {
    if values.len() == expected {
        Ok(())
    } else {
        Err(DecodeError::Shape {
            expected,
            got: values.len(),
        })
    }
}

impl MetricSnapshot {
    /// Decode the values returned for a [`Metric::SNAPSHOT`] read
    pub fn decode(values: &[NodeValue]) -> Result<Self, DecodeError> {
        expect_len(values, Metric::SNAPSHOT.len())?;
        Ok(Self {
            production_status: values[0].to_string(),
            production_rate: number(Metric::ProductionRate, &values[1])?,
            workorder_id: values[2].to_string(),
            temperature: number(Metric::Temperature, &values[3])?,
            good_count: integer(Metric::GoodCount, &values[4])?,
            bad_count: integer(Metric::BadCount, &values[5])?,
            error_flags: error_mask(&values[6])?,
        })
    }
}

/// Last confirmed view of a device
///
/// Only advanced after every publish of a tick succeeded, so deltas are
/// always taken against values the cloud has actually seen.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceState {
    pub production_rate: f64,
    pub good_count: i64,
    pub bad_count: i64,
    pub error_flags: ErrorFlags,
}

impl DeviceState {
    /// Decode the values returned for a [`Metric::BASELINE`] read
    pub fn decode_baseline(values: &[NodeValue]) -> Result<Self, DecodeError> {
        expect_len(values, Metric::BASELINE.len())?;
        Ok(Self {
            production_rate: number(Metric::ProductionRate, &values[0])?,
            good_count: integer(Metric::GoodCount, &values[1])?,
            bad_count: integer(Metric::BadCount, &values[2])?,
            error_flags: error_mask(&values[3])?,
        })
    }

    /// State to commit once a tick carrying `snapshot` has been published
    pub fn observed(snapshot: &MetricSnapshot) -> Self {
        Self {
            production_rate: snapshot.production_rate,
            good_count: snapshot.good_count,
            bad_count: snapshot.bad_count,
            error_flags: snapshot.error_flags,
        }
    }

    /// Everything a tick must publish for `snapshot`, relative to this state
    pub fn diff(&self, snapshot: &MetricSnapshot, alert_threshold: f64) -> TickOutcome {
        let telemetry = TelemetryEvent {
            production_status: snapshot.production_status.clone(),
            workorder_id: snapshot.workorder_id.clone(),
            temperature: snapshot.temperature,
            good_delta: snapshot.good_count - self.good_count,
            bad_delta: snapshot.bad_count - self.bad_count,
            temperature_alert: snapshot.temperature > alert_threshold,
        };

        let error = (snapshot.error_flags != self.error_flags)
            .then(|| ErrorEvent::transition(self.error_flags, snapshot.error_flags));

        let rate_changed = snapshot.production_rate != self.production_rate;
        let patch = TwinPatch {
            production_rate: rate_changed.then_some(snapshot.production_rate),
            error_mask: (snapshot.error_flags != self.error_flags)
                .then(|| snapshot.error_flags.raw()),
        };

        TickOutcome {
            telemetry,
            error,
            patch,
        }
    }
}

/// Outbound work produced by one tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub telemetry: TelemetryEvent,
    pub error: Option<ErrorEvent>,
    pub patch: TwinPatch,
}
