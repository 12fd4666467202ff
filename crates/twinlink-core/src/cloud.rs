//! Cloud messaging collaborator
//!
//! One [`CloudChannel`] is one device's authenticated connection. Inbound
//! commands, desired-property changes and cloud-to-device messages are
//! delivered through registered handlers.

use crate::error::{CloudChannelError, ConnectionStringError};
use crate::event::OutboundMessage;
use crate::message::{CloudMessage, CommandRequest, CommandResponse};
use crate::twin::{DesiredProperties, ReportedProperties, Twin};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub type CommandHandler =
    Arc<dyn Fn(CommandRequest) -> BoxFuture<'static, CommandResponse> + Send + Sync>;
pub type DesiredPropertyHandler =
    Arc<dyn Fn(DesiredProperties) -> BoxFuture<'static, ()> + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(CloudMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// A device's connection to the cloud hub
#[async_trait]
pub trait CloudChannel: Send + Sync {
    /// Device id the channel is authenticated as
    fn device_id(&self) -> &str;

    async fn publish_event(&self, message: OutboundMessage) -> Result<(), CloudChannelError>;

    async fn register_command_handler(
        &self,
        name: &str,
        handler: CommandHandler,
    ) -> Result<(), CloudChannelError>;

    /// Handler for commands with no named handler
    async fn register_default_command_handler(
        &self,
        handler: CommandHandler,
    ) -> Result<(), CloudChannelError>;

    async fn register_desired_property_handler(
        &self,
        handler: DesiredPropertyHandler,
    ) -> Result<(), CloudChannelError>;

    /// Handler for cloud-to-device messages; the message is completed once it returns
    async fn register_message_handler(&self, handler: MessageHandler)
        -> Result<(), CloudChannelError>;

    async fn get_twin(&self) -> Result<Twin, CloudChannelError>;

    async fn patch_reported_properties(
        &self,
        patch: ReportedProperties,
    ) -> Result<(), CloudChannelError>;

    /// Close the connection
    async fn close(&self) {}
}

/// Opens one [`CloudChannel`] per device connection string
#[async_trait]
pub trait CloudConnector: Send + Sync {
    async fn open(
        &self,
        connection: &ConnectionString,
    ) -> Result<Arc<dyn CloudChannel>, CloudChannelError>;
}

/// Device connection string: `HostName=...;DeviceId=...;SharedAccessKey=...`
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    shared_access_key: String,
}

impl ConnectionString {
    pub fn shared_access_key(&self) -> &str {
        &self.shared_access_key
    }
}

impl FromStr for ConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut device_id = None;
        let mut shared_access_key = None;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::Segment(part.to_string()))?;
            match key {
                "HostName" => host_name = Some(value.to_string()),
                "DeviceId" => device_id = Some(value.to_string()),
                "SharedAccessKey" => shared_access_key = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            host_name: host_name.ok_or(ConnectionStringError::Missing("HostName"))?,
            device_id: device_id.ok_or(ConnectionStringError::Missing("DeviceId"))?,
            shared_access_key: shared_access_key
                .ok_or(ConnectionStringError::Missing("SharedAccessKey"))?,
        })
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("shared_access_key", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.device_id, self.host_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connection_string() {
        let text = "HostName=hub.example.net;DeviceId=line-1;SharedAccessKey=a2V5PQ==";
        let conn: ConnectionString = text.parse().unwrap();
        assert_eq!(conn.host_name, "hub.example.net");
        assert_eq!(conn.device_id, "line-1");
        assert_eq!(conn.shared_access_key(), "a2V5PQ==");
        assert_eq!(conn.to_string(), "line-1@hub.example.net");
        assert!(!format!("{conn:?}").contains("a2V5"));
    }

    #[test]
    fn test_parse_connection_string_errors() {
        assert_eq!(
            "HostName=hub".parse::<ConnectionString>().unwrap_err(),
            ConnectionStringError::Missing("DeviceId")
        );
        assert_eq!(
            "HostName=hub;DeviceId=line-1".parse::<ConnectionString>().unwrap_err(),
            ConnectionStringError::Missing("SharedAccessKey")
        );

        let err = "garbage".parse::<ConnectionString>().unwrap_err();
        assert_eq!(err, ConnectionStringError::Segment("garbage".to_string()));
        assert_eq!(err.to_string(), "segment 'garbage' is not key=value");
    }
}
