//! In-memory automation server
//!
//! Holds node values per device and records method calls and writes, with
//! switches to make a device fail or respond slowly.

use crate::device::{Action, DeviceNumber, Metric};
use crate::error::InstrumentError;
use crate::instrument::{InstrumentClient, InstrumentSession};
use crate::state::ErrorFlags;
use crate::value::NodeValue;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Plant {
    values: DashMap<(DeviceNumber, Metric), NodeValue>,
    actions: DashMap<DeviceNumber, Vec<Action>>,
    writes: DashMap<DeviceNumber, Vec<(Metric, NodeValue)>>,
    failing: DashSet<DeviceNumber>,
    read_delay: DashMap<DeviceNumber, Duration>,
    unreachable: AtomicBool,
    reads: AtomicU64,
    open_sessions: AtomicU64,
}

/// Shared in-memory plant; every clone sees the same devices
#[derive(Clone, Default)]
pub struct MemoryInstrument {
    plant: Arc<Plant>,
}

impl MemoryInstrument {
    /// Create an empty plant
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a running device with zeroed counters and no errors
    pub fn add_device(&self, device: DeviceNumber) {
        self.set(device, Metric::ProductionStatus, 1);
        self.set(device, Metric::ProductionRate, 100);
        self.set(device, Metric::WorkorderId, format!("wo-{}", device.0));
        self.set(device, Metric::Temperature, 25.0);
        self.set(device, Metric::GoodCount, 0);
        self.set(device, Metric::BadCount, 0);
        self.set(device, Metric::DeviceError, 0);
    }

    pub fn set(&self, device: DeviceNumber, metric: Metric, value: impl Into<NodeValue>) {
        self.plant.values.insert((device, metric), value.into());
    }

    pub fn get(&self, device: DeviceNumber, metric: Metric) -> Option<NodeValue> {
        self.plant.values.get(&(device, metric)).map(|v| v.clone())
    }

    /// Make every operation on `device` fail until cleared
    pub fn set_failing(&self, device: DeviceNumber, failing: bool) {
        if failing {
            self.plant.failing.insert(device);
        } else {
            self.plant.failing.remove(&device);
        }
    }

    /// Delay every read of `device`
    pub fn set_read_delay(&self, device: DeviceNumber, delay: Duration) {
        self.plant.read_delay.insert(device, delay);
    }

    /// Refuse new connections
    pub fn set_unreachable(&self, unreachable: bool) {
        self.plant.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Methods invoked on `device`, oldest first
    pub fn actions(&self, device: DeviceNumber) -> Vec<Action> {
        self.plant
            .actions
            .get(&device)
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Setpoints written to `device`, oldest first
    pub fn writes(&self, device: DeviceNumber) -> Vec<(Metric, NodeValue)> {
        self.plant
            .writes
            .get(&device)
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    /// Total `read_metrics` calls across all sessions
    pub fn read_count(&self) -> u64 {
        self.plant.reads.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> u64 {
        self.plant.open_sessions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstrumentClient for MemoryInstrument {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn InstrumentSession>, InstrumentError> {
        if self.plant.unreachable.load(Ordering::SeqCst) {
            return Err(InstrumentError::new(endpoint, "connect", "endpoint unreachable"));
        }
        self.plant.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            endpoint: endpoint.to_string(),
            plant: self.plant.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

/// Session on a [`MemoryInstrument`]
pub struct MemorySession {
    endpoint: String,
    plant: Arc<Plant>,
    open: AtomicBool,
}

impl MemorySession {
    fn check(&self, device: DeviceNumber, operation: &str) -> Result<(), InstrumentError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(self.error(operation, "session closed"));
        }
        if self.plant.failing.contains(&device) {
            return Err(self.error(operation, format!("{device} not responding")));
        }
        Ok(())
    }

    fn error(&self, operation: &str, reason: impl Into<String>) -> InstrumentError {
        InstrumentError::new(&self.endpoint, operation, reason)
    }

    fn update_errors(&self, device: DeviceNumber, f: impl FnOnce(ErrorFlags) -> ErrorFlags) {
        let mut entry = self
            .plant
            .values
            .entry((device, Metric::DeviceError))
            .or_insert(NodeValue::Integer(0));
        let current = entry
            .as_i64()
            .and_then(ErrorFlags::from_raw)
            .unwrap_or_default();
        *entry = NodeValue::Integer(f(current).raw());
    }
}

#[async_trait]
impl InstrumentSession for MemorySession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn read_metrics(
        &self,
        device: DeviceNumber,
        metrics: &[Metric],
    ) -> Result<Vec<NodeValue>, InstrumentError> {
        self.plant.reads.fetch_add(1, Ordering::SeqCst);
        let delay = self.plant.read_delay.get(&device).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(device, "read")?;

        metrics
            .iter()
            .map(|metric| {
                self.plant
                    .values
                    .get(&(device, *metric))
                    .map(|v| v.clone())
                    .ok_or_else(|| {
                        self.error("read", format!("unknown node {}", metric.node_id(device)))
                    })
            })
            .collect()
    }

    async fn invoke_action(
        &self,
        device: DeviceNumber,
        action: Action,
    ) -> Result<(), InstrumentError> {
        self.check(device, "call")?;
        if !self.plant.values.contains_key(&(device, Metric::ProductionStatus)) {
            return Err(self.error("call", format!("unknown node {}", action.node_id(device))));
        }

        match action {
            Action::EmergencyStop => {
                self.plant
                    .values
                    .insert((device, Metric::ProductionStatus), NodeValue::Integer(0));
                self.update_errors(device, |flags| flags | ErrorFlags::EMERGENCY_STOP);
            }
            Action::ResetErrorStatus => self.update_errors(device, |_| ErrorFlags::empty()),
        }
        self.plant.actions.entry(device).or_default().push(action);
        Ok(())
    }

    async fn write_setpoint(
        &self,
        device: DeviceNumber,
        metric: Metric,
        value: NodeValue,
    ) -> Result<(), InstrumentError> {
        self.check(device, "write")?;
        self.plant.values.insert((device, metric), value.clone());
        self.plant.writes.entry(device).or_default().push((metric, value));
        Ok(())
    }

    async fn disconnect(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.plant.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
