//! TwinLink Bridge
//!
//! Process bootstrap for a device fleet: configuration file, logging and
//! the simulated plant the fleet runs against.

pub mod config;
pub mod logging;
pub mod simulation;

pub use config::{BridgeConfig, ConfigurationError};
pub use simulation::PlantSimulator;
