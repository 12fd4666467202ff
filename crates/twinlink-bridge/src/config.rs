//! Bridge configuration file
//!
//! ```toml
//! [instrument]
//! endpoint = "opc.tcp://localhost:4840/"
//!
//! [fleet]
//! poll_interval_ms = 1000
//! reconcile = "immediate"
//! unknown_commands = "reject"
//!
//! [[devices]]
//! number = 1
//! connection_string = "HostName=hub.example.net;DeviceId=line-1;SharedAccessKey=..."
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use twinlink_core::session::DEFAULT_ALERT_THRESHOLD;
use twinlink_core::{
    ConnectionStringError, DeviceNumber, FallbackPolicy, ReconcilePolicy, SessionConfig,
};
use twinlink_supervisor::{DeviceConfig, FleetConfig, FleetError};

/// Problems with the configuration file; all of them are fatal
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("device {number}: bad connection string: {source}")]
    ConnectionString {
        number: u32,
        #[source]
        source: ConnectionStringError,
    },

    #[error(transparent)]
    Fleet(#[from] FleetError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    pub instrument: InstrumentSection,

    #[serde(default)]
    pub fleet: FleetSection,

    #[serde(default)]
    pub simulation: SimulationSection,

    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentSection {
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetSection {
    pub poll_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    pub inbox_capacity: usize,
    pub temperature_alert_threshold: f64,
    pub reconcile: ReconcilePolicy,
    pub unknown_commands: FallbackPolicy,
    pub diagnostics: bool,
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            shutdown_grace_ms: 5000,
            inbox_capacity: 32,
            temperature_alert_threshold: DEFAULT_ALERT_THRESHOLD,
            reconcile: ReconcilePolicy::default(),
            unknown_commands: FallbackPolicy::default(),
            diagnostics: false,
        }
    }
}

/// Settings for the simulated plant the binary drives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationSection {
    /// Time between plant updates
    pub step_ms: u64,

    /// Every n-th step produces one bad part
    pub bad_part_every: u64,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            step_ms: 1000,
            bad_part_every: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    pub number: u32,
    pub connection_string: String,
}

impl BridgeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build and validate the fleet configuration
    pub fn fleet_config(&self) -> Result<FleetConfig, ConfigurationError> {
        let devices = self
            .devices
            .iter()
            .map(|entry| {
                let connection = entry.connection_string.parse().map_err(|source| {
                    ConfigurationError::ConnectionString {
                        number: entry.number,
                        source,
                    }
                })?;
                Ok(DeviceConfig {
                    number: DeviceNumber(entry.number),
                    connection,
                })
            })
            .collect::<Result<Vec<_>, ConfigurationError>>()?;

        let fleet = FleetConfig {
            endpoint: self.instrument.endpoint.clone(),
            poll_interval: Duration::from_millis(self.fleet.poll_interval_ms),
            shutdown_grace: Duration::from_millis(self.fleet.shutdown_grace_ms),
            inbox_capacity: self.fleet.inbox_capacity,
            session: SessionConfig {
                alert_threshold: self.fleet.temperature_alert_threshold,
                reconcile: self.fleet.reconcile,
                fallback: self.fleet.unknown_commands,
                diagnostics: self.fleet.diagnostics,
            },
            devices,
        };
        fleet.validate()?;
        Ok(fleet)
    }

    pub fn device_numbers(&self) -> Vec<DeviceNumber> {
        self.devices.iter().map(|d| DeviceNumber(d.number)).collect()
    }
}
