//! Industrial-protocol collaborator
//!
//! The protocol client itself lives outside this crate; twinlink only
//! needs node reads, method calls and setpoint writes over a session.

use crate::device::{Action, DeviceNumber, Metric};
use crate::error::InstrumentError;
use crate::state::{DeviceState, MetricSnapshot};
use crate::value::NodeValue;
use async_trait::async_trait;

/// Opens sessions against an automation server endpoint
#[async_trait]
pub trait InstrumentClient: Send + Sync {
    /// Connect to `endpoint`, e.g. `opc.tcp://localhost:4840/`
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn InstrumentSession>, InstrumentError>;
}

/// An open session on one automation server
#[async_trait]
pub trait InstrumentSession: Send + Sync {
    /// Endpoint this session is connected to
    fn endpoint(&self) -> &str;

    /// Read the given metrics of one device
    ///
    /// The returned values are in the same order as `metrics`.
    async fn read_metrics(
        &self,
        device: DeviceNumber,
        metrics: &[Metric],
    ) -> Result<Vec<NodeValue>, InstrumentError>;

    /// Invoke a device method
    async fn invoke_action(&self, device: DeviceNumber, action: Action)
        -> Result<(), InstrumentError>;

    /// Write a writable variable of a device
    async fn write_setpoint(
        &self,
        device: DeviceNumber,
        metric: Metric,
        value: NodeValue,
    ) -> Result<(), InstrumentError>;

    /// Release the session
    async fn disconnect(&self) {}
}

/// Read and decode one full [`MetricSnapshot`] of a device
pub async fn read_snapshot(
    session: &dyn InstrumentSession,
    device: DeviceNumber,
) -> Result<MetricSnapshot, InstrumentError> {
    let values = session.read_metrics(device, &Metric::SNAPSHOT).await?;
    MetricSnapshot::decode(&values)
        .map_err(|e| InstrumentError::new(session.endpoint(), "decode snapshot", e.to_string()))
}

/// Read and decode the baseline [`DeviceState`] of a device
pub async fn read_baseline(
    session: &dyn InstrumentSession,
    device: DeviceNumber,
) -> Result<DeviceState, InstrumentError> {
    let values = session.read_metrics(device, &Metric::BASELINE).await?;
    DeviceState::decode_baseline(&values)
        .map_err(|e| InstrumentError::new(session.endpoint(), "decode baseline", e.to_string()))
}
