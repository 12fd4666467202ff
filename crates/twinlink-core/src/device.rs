//! Device addressing on the automation server
//!
//! Every instrument is an object node `ns=2;s=Device {n}` with one child
//! variable per metric and one child method per action.

use crate::cloud::CloudChannel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Namespace index the instrument nodes live in
pub const NODE_NAMESPACE: u16 = 2;

/// Ordinal of a device on the automation server (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceNumber(pub u32);

impl DeviceNumber {
    /// Object node that owns this device's metrics and methods
    pub fn object_node(self) -> String {
        format!("ns={NODE_NAMESPACE};s=Device {}", self.0)
    }

    /// Node id of one of this device's child nodes
    pub fn child_node(self, name: &str) -> String {
        format!("ns={NODE_NAMESPACE};s=Device {}/{name}", self.0)
    }
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device {}", self.0)
    }
}

/// Named metrics read on every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    ProductionStatus,
    ProductionRate,
    WorkorderId,
    Temperature,
    GoodCount,
    BadCount,
    DeviceError,
}

impl Metric {
    /// The full snapshot, in the order a
    /// [`MetricSnapshot`](crate::state::MetricSnapshot) is decoded
    pub const SNAPSHOT: [Metric; 7] = [
        Metric::ProductionStatus,
        Metric::ProductionRate,
        Metric::WorkorderId,
        Metric::Temperature,
        Metric::GoodCount,
        Metric::BadCount,
        Metric::DeviceError,
    ];

    /// Metrics read once at session construction to seed device state
    pub const BASELINE: [Metric; 4] = [
        Metric::ProductionRate,
        Metric::GoodCount,
        Metric::BadCount,
        Metric::DeviceError,
    ];

    /// Browse name of the variable node
    pub fn name(self) -> &'static str {
        match self {
            Metric::ProductionStatus => "ProductionStatus",
            Metric::ProductionRate => "ProductionRate",
            Metric::WorkorderId => "WorkorderId",
            Metric::Temperature => "Temperature",
            Metric::GoodCount => "GoodCount",
            Metric::BadCount => "BadCount",
            Metric::DeviceError => "DeviceError",
        }
    }

    /// Node id of this metric on the given device
    pub fn node_id(self, device: DeviceNumber) -> String {
        device.child_node(self.name())
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Methods that can be invoked on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    EmergencyStop,
    ResetErrorStatus,
}

impl Action {
    /// Browse name of the method node
    pub fn name(self) -> &'static str {
        match self {
            Action::EmergencyStop => "EmergencyStop",
            Action::ResetErrorStatus => "ResetErrorStatus",
        }
    }

    /// Method node id on the given device
    pub fn node_id(self, device: DeviceNumber) -> String {
        device.child_node(self.name())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable identity of one bridged device
#[derive(Clone)]
pub struct DeviceIdentity {
    pub number: DeviceNumber,
    pub endpoint: String,
    pub cloud: Arc<dyn CloudChannel>,
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("number", &self.number)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
