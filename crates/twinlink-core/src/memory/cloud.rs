//! In-memory cloud hub
//!
//! Records every published event and reported patch in order, keeps a twin
//! document, and lets tests act as the cloud side by invoking the handlers
//! a device registered.

use crate::cloud::{
    CloudChannel, CloudConnector, CommandHandler, ConnectionString, DesiredPropertyHandler,
    MessageHandler,
};
use crate::error::CloudChannelError;
use crate::event::{DeviceEvent, OutboundMessage};
use crate::message::{CloudMessage, CommandRequest, CommandResponse};
use crate::twin::{DesiredProperties, ReportedProperties, Twin};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as Json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

const STATUS_NO_HANDLER: u16 = 501;

/// Hub handing out one [`MemoryChannel`] per device id
#[derive(Clone, Default)]
pub struct MemoryCloud {
    channels: Arc<DashMap<String, Arc<MemoryChannel>>>,
    refuse: Arc<DashMap<String, ()>>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel opened for `device_id`, if any
    pub fn channel(&self, device_id: &str) -> Option<Arc<MemoryChannel>> {
        self.channels.get(device_id).map(|c| c.clone())
    }

    /// Make `open` fail for `device_id`
    pub fn refuse(&self, device_id: &str) {
        self.refuse.insert(device_id.to_string(), ());
    }
}

#[async_trait]
impl CloudConnector for MemoryCloud {
    async fn open(
        &self,
        connection: &ConnectionString,
    ) -> Result<Arc<dyn CloudChannel>, CloudChannelError> {
        if self.refuse.contains_key(&connection.device_id) {
            return Err(CloudChannelError::new("open", format!("{connection} refused")));
        }
        let channel = self
            .channels
            .entry(connection.device_id.clone())
            .or_insert_with(|| Arc::new(MemoryChannel::new(connection.device_id.clone())))
            .clone();
        Ok(channel)
    }
}

/// One device's in-memory cloud connection
pub struct MemoryChannel {
    device_id: String,
    sequence: AtomicU64,
    events: DashMap<u64, OutboundMessage>,
    patches: DashMap<u64, ReportedProperties>,
    twin: Mutex<Twin>,
    command_handlers: DashMap<String, CommandHandler>,
    default_handler: Mutex<Option<CommandHandler>>,
    desired_handler: Mutex<Option<DesiredPropertyHandler>>,
    message_handler: Mutex<Option<MessageHandler>>,
    fail_events: AtomicBool,
    fail_patches: AtomicBool,
    closed: AtomicBool,
}

impl MemoryChannel {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            sequence: AtomicU64::new(0),
            events: DashMap::new(),
            patches: DashMap::new(),
            twin: Mutex::new(Twin::default()),
            command_handlers: DashMap::new(),
            default_handler: Mutex::new(None),
            desired_handler: Mutex::new(None),
            message_handler: Mutex::new(None),
            fail_events: AtomicBool::new(false),
            fail_patches: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn next(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn ordered<T: Clone>(map: &DashMap<u64, T>) -> Vec<T> {
        let mut entries: Vec<(u64, T)> =
            map.iter().map(|e| (*e.key(), e.value().clone())).collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, v)| v).collect()
    }

    /// Published messages, oldest first
    pub fn messages(&self) -> Vec<OutboundMessage> {
        Self::ordered(&self.events)
    }

    /// Published events decoded from their payloads, oldest first
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.messages()
            .iter()
            .filter_map(|m| m.decode().ok())
            .collect()
    }

    /// Reported patches, oldest first
    pub fn patches(&self) -> Vec<ReportedProperties> {
        Self::ordered(&self.patches)
    }

    /// Forget recorded events and patches
    pub fn clear(&self) {
        self.events.clear();
        self.patches.clear();
    }

    pub fn set_fail_events(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_patches(&self, fail: bool) {
        self.fail_patches.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Replace the twin document returned by `get_twin`
    pub fn set_twin(&self, twin: Twin) {
        if let Ok(mut current) = self.twin.lock() {
            *current = twin;
        }
    }

    /// Names with a registered command handler
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.command_handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Call a command as the cloud would: named handler first, then the default
    pub async fn invoke_command(&self, name: &str, payload: Json) -> CommandResponse {
        let named = self.command_handlers.get(name).map(|h| h.clone());
        let handler = named.or_else(|| self.default_handler.lock().ok().and_then(|h| h.clone()));
        match handler {
            Some(handler) => handler(CommandRequest::new(name, payload)).await,
            None => CommandResponse::with_status(STATUS_NO_HANDLER, "no handler registered"),
        }
    }

    /// Deliver a desired-properties change; false when nobody listens
    pub async fn push_desired(&self, desired: DesiredProperties) -> bool {
        if let Ok(mut twin) = self.twin.lock() {
            for (name, value) in &desired.properties {
                twin.desired.insert(name.clone(), value.clone());
            }
        }
        let handler = self.desired_handler.lock().ok().and_then(|h| h.clone());
        match handler {
            Some(handler) => {
                handler(desired).await;
                true
            }
            None => false,
        }
    }

    /// Deliver a cloud-to-device message; false when nobody listens
    pub async fn push_message(&self, message: CloudMessage) -> bool {
        let handler = self.message_handler.lock().ok().and_then(|h| h.clone());
        match handler {
            Some(handler) => {
                handler(message).await;
                true
            }
            None => false,
        }
    }

    fn ensure_open(&self, operation: &str) -> Result<(), CloudChannelError> {
        if self.is_closed() {
            Err(CloudChannelError::new(operation, "channel closed"))
        } else {
            Ok(())
        }
    }

    fn store<T>(slot: &Mutex<Option<T>>, value: T) -> Result<(), CloudChannelError> {
        let mut slot = slot
            .lock()
            .map_err(|_| CloudChannelError::new("register", "handler slot poisoned"))?;
        *slot = Some(value);
        Ok(())
    }
}

#[async_trait]
impl CloudChannel for MemoryChannel {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn publish_event(&self, message: OutboundMessage) -> Result<(), CloudChannelError> {
        self.ensure_open("send event")?;
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(CloudChannelError::new("send event", "hub unavailable"));
        }
        debug!(device = %self.device_id, id = %message.message_id, "event accepted");
        self.events.insert(self.next(), message);
        Ok(())
    }

    async fn register_command_handler(
        &self,
        name: &str,
        handler: CommandHandler,
    ) -> Result<(), CloudChannelError> {
        self.ensure_open("register")?;
        self.command_handlers.insert(name.to_string(), handler);
        Ok(())
    }

    async fn register_default_command_handler(
        &self,
        handler: CommandHandler,
    ) -> Result<(), CloudChannelError> {
        self.ensure_open("register")?;
        Self::store(&self.default_handler, handler)
    }

    async fn register_desired_property_handler(
        &self,
        handler: DesiredPropertyHandler,
    ) -> Result<(), CloudChannelError> {
        self.ensure_open("register")?;
        Self::store(&self.desired_handler, handler)
    }

    async fn register_message_handler(
        &self,
        handler: MessageHandler,
    ) -> Result<(), CloudChannelError> {
        self.ensure_open("register")?;
        Self::store(&self.message_handler, handler)
    }

    async fn get_twin(&self) -> Result<Twin, CloudChannelError> {
        self.ensure_open("get twin")?;
        self.twin
            .lock()
            .map(|t| t.clone())
            .map_err(|_| CloudChannelError::new("get twin", "twin poisoned"))
    }

    async fn patch_reported_properties(
        &self,
        patch: ReportedProperties,
    ) -> Result<(), CloudChannelError> {
        self.ensure_open("update reported properties")?;
        if self.fail_patches.load(Ordering::SeqCst) {
            return Err(CloudChannelError::new(
                "update reported properties",
                "hub unavailable",
            ));
        }
        if let Ok(mut twin) = self.twin.lock() {
            for (name, value) in &patch {
                twin.reported.insert(name.clone(), value.clone());
            }
        }
        self.patches.insert(self.next(), patch);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
