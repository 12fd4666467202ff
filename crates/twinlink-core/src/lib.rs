//! TwinLink Core
//!
//! This crate provides the per-device synchronization engine between an
//! industrial instrument and its cloud twin:
//! - Delta telemetry and bitmask-diff error events between successive polls
//! - Selective twin patches carrying only what changed
//! - Command dispatch and desired-property application to the instrument
//! - Collaborator traits for the instrument and cloud clients, plus
//!   in-memory implementations

pub mod cloud;
pub mod command;
pub mod desired;
pub mod device;
pub mod error;
pub mod event;
pub mod instrument;
pub mod memory;
pub mod message;
pub mod session;
pub mod state;
pub mod twin;
pub mod value;

pub use cloud::{CloudChannel, CloudConnector, ConnectionString};
pub use command::{CommandDispatcher, FallbackPolicy};
pub use desired::{DesiredStateApplier, ReconcilePolicy};
pub use device::{Action, DeviceIdentity, DeviceNumber, Metric};
pub use error::{
    CloudChannelError, CommandError, ConnectionStringError, InstrumentError, SyncError,
};
pub use event::{DeviceEvent, ErrorEvent, OutboundMessage, TelemetryEvent};
pub use instrument::{InstrumentClient, InstrumentSession};
pub use message::{CloudMessage, CommandRequest, CommandResponse, DeviceMessage};
pub use session::{DeviceSession, SessionConfig};
pub use state::{DeviceState, ErrorFlags, MetricSnapshot, TickOutcome};
pub use twin::{DesiredProperties, Twin, TwinPatch};
pub use value::NodeValue;
