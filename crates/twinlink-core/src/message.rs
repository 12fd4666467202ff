//! Messages delivered to a device's inbox
//!
//! Cloud callbacks and the fleet scheduler never touch a session directly;
//! they post one of these and the device's worker handles them in order.

use crate::twin::DesiredProperties;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::oneshot;

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_UNAVAILABLE: u16 = 503;

/// Direct method invocation from the cloud
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub name: String,
    #[serde(default)]
    pub payload: Json,
}

impl CommandRequest {
    pub fn new(name: impl Into<String>, payload: Json) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Result returned to the command's caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub payload: Json,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            status: STATUS_OK,
            payload: Json::Null,
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: serde_json::json!({ "message": message.into() }),
        }
    }

    /// The device's worker is gone or did not answer
    pub fn unavailable() -> Self {
        Self::with_status(STATUS_UNAVAILABLE, "device unavailable")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Cloud-to-device message
#[derive(Debug, Clone, PartialEq)]
pub struct CloudMessage {
    pub message_id: String,
    pub body: Vec<u8>,
    pub properties: BTreeMap<String, String>,
}

/// Work item for a device's worker
pub enum DeviceMessage {
    /// Run one scheduled read-diff-publish-commit cycle
    Tick,

    /// Execute a command and answer on `reply`
    Command {
        request: CommandRequest,
        reply: oneshot::Sender<CommandResponse>,
    },

    /// Apply a desired-properties change
    DesiredProperties(DesiredProperties),

    /// Record a cloud-to-device message
    CloudMessage(CloudMessage),
}

impl DeviceMessage {
    /// Build a command message together with the receiver for its reply
    pub fn command(request: CommandRequest) -> (Self, oneshot::Receiver<CommandResponse>) {
        let (reply, rx) = oneshot::channel();
        (Self::Command { request, reply }, rx)
    }
}

impl fmt::Debug for DeviceMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tick => write!(f, "Tick"),
            Self::Command { request, .. } => write!(f, "Command({})", request.name),
            Self::DesiredProperties(desired) => {
                write!(f, "DesiredProperties({} keys)", desired.properties.len())
            }
            Self::CloudMessage(message) => write!(f, "CloudMessage({})", message.message_id),
        }
    }
}
