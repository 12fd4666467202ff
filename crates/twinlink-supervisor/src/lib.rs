//! TwinLink Supervisor
//!
//! Runs a fleet of device sessions:
//! - Concurrent start-up with per-device failure isolation
//! - One worker task per device, fed through an inbox
//! - Fixed-interval scheduling that skips devices still mid-tick
//! - Graceful shutdown with a bounded grace period

pub mod config;
pub mod error;
pub mod fleet;
mod worker;

pub use config::{DeviceConfig, FleetConfig};
pub use error::FleetError;
pub use fleet::{Fleet, FleetStats};
pub use worker::DeviceStats;
