//! Fleet configuration

use crate::error::FleetError;
use std::collections::HashSet;
use std::time::Duration;
use twinlink_core::{ConnectionString, DeviceNumber, SessionConfig};

/// One device to bridge: its instrument ordinal and its cloud identity
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub number: DeviceNumber,
    pub connection: ConnectionString,
}

/// Configuration for a fleet of device sessions
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Automation server every device is read from
    pub endpoint: String,

    /// Time between scheduled ticks
    pub poll_interval: Duration,

    /// How long workers get to finish after shutdown is requested
    pub shutdown_grace: Duration,

    /// Capacity of each device inbox
    pub inbox_capacity: usize,

    /// Behaviour shared by every session
    pub session: SessionConfig,

    pub devices: Vec<DeviceConfig>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            endpoint: "opc.tcp://localhost:4840/".to_string(),
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            inbox_capacity: 32,
            session: SessionConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl FleetConfig {
    /// Reject configurations the fleet cannot run with
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.endpoint.trim().is_empty() {
            return Err(FleetError::Configuration(
                "instrument endpoint is empty".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(FleetError::Configuration(
                "poll interval must be positive".into(),
            ));
        }
        if self.inbox_capacity == 0 {
            return Err(FleetError::Configuration(
                "inbox capacity must be positive".into(),
            ));
        }
        if self.devices.is_empty() {
            return Err(FleetError::Configuration("no devices configured".into()));
        }

        let mut numbers = HashSet::new();
        let mut cloud_ids = HashSet::new();
        for device in &self.devices {
            if device.number.0 == 0 {
                return Err(FleetError::Configuration(
                    "device numbers start at 1".into(),
                ));
            }
            if !numbers.insert(device.number) {
                return Err(FleetError::Configuration(format!(
                    "{} configured twice",
                    device.number
                )));
            }
            if !cloud_ids.insert(device.connection.device_id.as_str()) {
                return Err(FleetError::Configuration(format!(
                    "cloud device '{}' used by more than one device",
                    device.connection.device_id
                )));
            }
        }
        Ok(())
    }
}
