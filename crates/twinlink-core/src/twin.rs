//! Cloud-side twin document and the partial patches sent to it
//!
//! The twin is soft state: reported properties are only ever patched, never
//! replaced, and a later patch may be overtaken by an earlier one in flight.

use crate::state::DeviceState;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

pub const PRODUCTION_RATE: &str = "productionRate";
pub const ERROR_MASK: &str = "errorMask";
pub const LAST_APP_LAUNCH: &str = "DateTimeLastAppLaunch";
pub const LAST_DESIRED_CHANGE: &str = "DateTimeLastDesiredPropertyChangedReceived";

/// A reported-properties patch, as sent to the cloud channel
pub type ReportedProperties = Map<String, Json>;

/// Twin document returned by the cloud channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Twin {
    #[serde(default)]
    pub desired: Map<String, Json>,
    #[serde(default)]
    pub reported: Map<String, Json>,
}

impl Twin {
    /// Reported value that disagrees with `state`, per tracked field
    ///
    /// A field absent from the reported section counts as a disagreement.
    pub fn stale_fields(&self, state: &DeviceState) -> TwinPatch {
        let reported_rate = self.reported.get(PRODUCTION_RATE).and_then(Json::as_f64);
        let reported_mask = self.reported.get(ERROR_MASK).and_then(Json::as_i64);

        let rate_stale = reported_rate != Some(state.production_rate);
        TwinPatch {
            production_rate: rate_stale.then_some(state.production_rate),
            error_mask: (reported_mask != Some(state.error_flags.raw()))
                .then(|| state.error_flags.raw()),
        }
    }
}

/// The tracked fields that changed since the last committed tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub production_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_mask: Option<i64>,
}

impl TwinPatch {
    /// True when there is nothing to send
    pub fn is_empty(&self) -> bool {
        self.production_rate.is_none() && self.error_mask.is_none()
    }

    /// Reported-properties document carrying only the present fields
    pub fn to_reported(self) -> ReportedProperties {
        let mut reported = Map::new();
        if let Some(rate) = self.production_rate {
            reported.insert(PRODUCTION_RATE.to_string(), Json::from(rate));
        }
        if let Some(mask) = self.error_mask {
            reported.insert(ERROR_MASK.to_string(), Json::from(mask));
        }
        reported
    }
}

/// Reported patch sent once when a session starts
pub fn launch_report(stale: TwinPatch, now: DateTime<Utc>) -> ReportedProperties {
    let mut reported = stale.to_reported();
    reported.insert(LAST_APP_LAUNCH.to_string(), Json::from(timestamp(now)));
    reported
}

/// Reported patch acknowledging a desired-properties notification
pub fn desired_change_report(now: DateTime<Utc>) -> ReportedProperties {
    let mut reported = Map::new();
    reported.insert(LAST_DESIRED_CHANGE.to_string(), Json::from(timestamp(now)));
    reported
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Desired-properties change notification delivered by the cloud channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredProperties {
    #[serde(rename = "$version", default)]
    pub version: Option<i64>,
    #[serde(flatten)]
    pub properties: Map<String, Json>,
}

impl DesiredProperties {
    pub fn get(&self, name: &str) -> Option<&Json> {
        self.properties.get(name)
    }
}
