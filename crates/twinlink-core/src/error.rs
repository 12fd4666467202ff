//! Error taxonomy for device synchronization

use crate::device::DeviceNumber;
use thiserror::Error;

/// Failure of any instrument operation, with endpoint and operation context
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("instrument {operation} on {endpoint} failed: {reason}")]
pub struct InstrumentError {
    pub endpoint: String,
    pub operation: String,
    pub reason: String,
}

impl InstrumentError {
    pub fn new(
        endpoint: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of any cloud channel operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cloud channel {operation} failed: {reason}")]
pub struct CloudChannelError {
    pub operation: String,
    pub reason: String,
}

impl CloudChannelError {
    pub fn new(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

/// Why a device connection string was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionStringError {
    #[error("segment '{0}' is not key=value")]
    Segment(String),

    #[error("missing {0}")]
    Missing(&'static str),
}

/// Errors raised by a device session
#[derive(Debug, Error)]
pub enum SyncError {
    /// Instrument unreachable or baseline read failed while opening the session
    #[error("{device} failed to initialize: {source}")]
    Initialization {
        device: DeviceNumber,
        #[source]
        source: InitializationCause,
    },

    /// A scheduled metric read failed; state is unchanged
    #[error("{device} metric read failed: {source}")]
    Read {
        device: DeviceNumber,
        #[source]
        source: InstrumentError,
    },

    /// An event or twin patch could not be delivered; state is unchanged
    #[error("{device} publish failed: {source}")]
    Publish {
        device: DeviceNumber,
        #[source]
        source: CloudChannelError,
    },

    /// Writing a desired setpoint to the instrument failed
    #[error("{device} setpoint write failed: {source}")]
    Apply {
        device: DeviceNumber,
        #[source]
        source: InstrumentError,
    },
}

impl SyncError {
    /// Device the error belongs to
    pub fn device(&self) -> DeviceNumber {
        match self {
            Self::Initialization { device, .. }
            | Self::Read { device, .. }
            | Self::Publish { device, .. }
            | Self::Apply { device, .. } => *device,
        }
    }
}

/// Collaborator that failed while a session was being opened
#[derive(Debug, Error)]
pub enum InitializationCause {
    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error(transparent)]
    Cloud(#[from] CloudChannelError),
}

/// Reasons a command is not acknowledged as succeeded
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    Unrecognized(String),

    #[error("invalid payload for '{command}': {reason}")]
    InvalidPayload { command: String, reason: String },

    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error(transparent)]
    Cloud(#[from] CloudChannelError),
}

impl CommandError {
    /// Status code reported back to the command's caller
    pub fn status(&self) -> u16 {
        match self {
            Self::Unrecognized(_) | Self::InvalidPayload { .. } => 400,
            Self::Instrument(_) | Self::Cloud(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_status() {
        assert_eq!(CommandError::Unrecognized("Foo".into()).status(), 400);
        let failed = InstrumentError::new("opc.tcp://localhost:4840/", "call", "timeout");
        assert_eq!(CommandError::from(failed).status(), 500);
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = SyncError::Read {
            device: DeviceNumber(2),
            source: InstrumentError::new("opc.tcp://plant:4840/", "read", "bad node"),
        };
        let text = err.to_string();
        assert!(text.contains("Device 2"));
        assert!(text.contains("opc.tcp://plant:4840/"));
        assert_eq!(err.device(), DeviceNumber(2));
    }
}
