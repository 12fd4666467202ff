//! Translation of cloud commands into instrument actions

use crate::cloud::CloudChannel;
use crate::device::{Action, DeviceNumber};
use crate::error::CommandError;
use crate::event::{DeviceEvent, OutboundMessage, SnapshotRecord};
use crate::instrument::{read_snapshot, InstrumentSession};
use crate::message::{CommandRequest, CommandResponse};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

pub const EMERGENCY_STOP: &str = "EmergencyStop";
pub const RESET_ERROR_STATUS: &str = "ResetErrorStatus";
pub const SEND_MESSAGES: &str = "SendMessages";

/// Upper bound on messages sent by one `SendMessages` burst
pub const MAX_BURST_MESSAGES: u32 = 100;
/// Upper bound on the delay between burst messages
pub const MAX_BURST_DELAY: Duration = Duration::from_secs(10);

/// What to do with a command nobody registered a handler for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
    /// Answer 400 without touching the instrument
    #[default]
    Reject,
    /// Answer 200 without touching the instrument
    Acknowledge,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessagesPayload {
    nr_of_messages: u32,
    #[serde(default)]
    delay: u64,
}

/// Command handling for one device
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    device: DeviceNumber,
    fallback: FallbackPolicy,
    diagnostics: bool,
}

impl CommandDispatcher {
    pub fn new(device: DeviceNumber, fallback: FallbackPolicy, diagnostics: bool) -> Self {
        Self {
            device,
            fallback,
            diagnostics,
        }
    }

    /// Commands that get a named handler on the cloud channel
    pub fn command_names(&self) -> Vec<&'static str> {
        let mut names = vec![EMERGENCY_STOP, RESET_ERROR_STATUS];
        if self.diagnostics {
            names.push(SEND_MESSAGES);
        }
        names
    }

    /// Execute `request` and produce the response for its caller
    ///
    /// Never synthesizes telemetry of its own; the effect of an action
    /// shows up in the next scheduled tick.
    pub async fn dispatch(
        &self,
        instrument: &dyn InstrumentSession,
        cloud: &dyn CloudChannel,
        request: &CommandRequest,
    ) -> CommandResponse {
        info!(device = self.device.0, command = %request.name, "command received");

        match self.execute(instrument, cloud, request).await {
            Ok(response) => response,
            Err(CommandError::Unrecognized(name))
                if self.fallback == FallbackPolicy::Acknowledge =>
            {
                info!(device = self.device.0, command = %name, "no handler, acknowledged");
                CommandResponse::ok()
            }
            Err(err) => {
                warn!(
                    device = self.device.0,
                    command = %request.name,
                    error = %err,
                    "command failed"
                );
                CommandResponse::with_status(err.status(), err.to_string())
            }
        }
    }

    async fn execute(
        &self,
        instrument: &dyn InstrumentSession,
        cloud: &dyn CloudChannel,
        request: &CommandRequest,
    ) -> Result<CommandResponse, CommandError> {
        match request.name.as_str() {
            EMERGENCY_STOP => self.invoke(instrument, Action::EmergencyStop).await,
            RESET_ERROR_STATUS => self.invoke(instrument, Action::ResetErrorStatus).await,
            SEND_MESSAGES if self.diagnostics => {
                self.send_messages(instrument, cloud, request).await
            }
            other => Err(CommandError::Unrecognized(other.to_string())),
        }
    }

    async fn invoke(
        &self,
        instrument: &dyn InstrumentSession,
        action: Action,
    ) -> Result<CommandResponse, CommandError> {
        instrument.invoke_action(self.device, action).await?;
        info!(device = self.device.0, %action, "action invoked");
        Ok(CommandResponse::ok())
    }

    /// Publish a bounded burst of absolute snapshot records
    async fn send_messages(
        &self,
        instrument: &dyn InstrumentSession,
        cloud: &dyn CloudChannel,
        request: &CommandRequest,
    ) -> Result<CommandResponse, CommandError> {
        let payload: SendMessagesPayload = serde_json::from_value(request.payload.clone())
            .map_err(|e| CommandError::InvalidPayload {
                command: request.name.clone(),
                reason: e.to_string(),
            })?;
        let count = payload.nr_of_messages.min(MAX_BURST_MESSAGES);
        let delay = Duration::from_millis(payload.delay).min(MAX_BURST_DELAY);

        for i in 0..count {
            let snapshot = read_snapshot(instrument, self.device).await?;
            let event = DeviceEvent::Snapshot(SnapshotRecord::from(&snapshot));
            cloud.publish_event(OutboundMessage::encode(&event)?).await?;
            info!(device = self.device.0, message = i, %event, "diagnostic message sent");

            if i + 1 < count {
                tokio::time::sleep(delay).await;
            }
        }

        Ok(CommandResponse {
            status: crate::message::STATUS_OK,
            payload: serde_json::json!({ "sent": count }),
        })
    }
}
