//! Fleet supervision
//!
//! The fleet opens every configured device, hands each session to its own
//! worker task and schedules ticks on a fixed interval. A device whose
//! previous tick is still running is skipped for that round, so a slow
//! instrument never delays the others.

use crate::config::{DeviceConfig, FleetConfig};
use crate::error::FleetError;
use crate::worker::{bind_handlers, DeviceStats, DeviceWorker, TickCounters};
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use twinlink_core::error::InitializationCause;
use twinlink_core::{
    CloudConnector, DeviceIdentity, DeviceMessage, DeviceNumber, DeviceSession, InstrumentClient,
    SyncError,
};

/// How long interrupted workers get to close their sessions before abort
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot of per-device tick counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetStats {
    pub devices: BTreeMap<DeviceNumber, DeviceStats>,
}

impl FleetStats {
    /// Counts summed over every device
    pub fn total(&self) -> DeviceStats {
        self.devices
            .values()
            .fold(DeviceStats::default(), |acc, s| DeviceStats {
                completed: acc.completed + s.completed,
                failed: acc.failed + s.failed,
                skipped: acc.skipped + s.skipped,
            })
    }
}

struct DeviceHandle {
    inbox: mpsc::Sender<DeviceMessage>,
    busy: Arc<AtomicBool>,
    counters: Arc<TickCounters>,
    task: JoinHandle<()>,
}

struct OpenedDevice {
    session: DeviceSession,
    inbox: mpsc::Sender<DeviceMessage>,
    receiver: mpsc::Receiver<DeviceMessage>,
}

/// Running set of device workers
pub struct Fleet {
    config: FleetConfig,
    devices: DashMap<DeviceNumber, DeviceHandle>,
    /// Counters of devices whose worker already exited
    retired: DashMap<DeviceNumber, Arc<TickCounters>>,
    cancel: CancellationToken,
    halt: CancellationToken,
}

impl Fleet {
    /// Validate `config`, open every device concurrently and start workers
    ///
    /// Devices that fail to initialize are logged and left out. Fails only
    /// when the configuration is invalid or no device came up.
    pub async fn start(
        config: FleetConfig,
        instrument: Arc<dyn InstrumentClient>,
        cloud: Arc<dyn CloudConnector>,
    ) -> Result<Self, FleetError> {
        config.validate()?;

        let opened = join_all(
            config
                .devices
                .iter()
                .map(|device| open_device(&config, device, instrument.as_ref(), cloud.as_ref())),
        )
        .await;

        let cancel = CancellationToken::new();
        let halt = CancellationToken::new();
        let devices = DashMap::new();
        let mut failed = 0;
        for result in opened {
            match result {
                Ok(opened) => {
                    let number = opened.session.number();
                    devices.insert(number, spawn_worker(opened, &cancel, &halt));
                }
                Err(err) => {
                    failed += 1;
                    error!(device = err.device().0, error = %err, "device excluded from fleet");
                }
            }
        }

        if devices.is_empty() {
            return Err(FleetError::NoDevices { failed });
        }

        info!(
            endpoint = %config.endpoint,
            devices = devices.len(),
            failed,
            interval = ?config.poll_interval,
            "fleet started"
        );

        Ok(Self {
            config,
            devices,
            retired: DashMap::new(),
            cancel,
            halt,
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Devices with a live worker, in ascending order
    pub fn devices(&self) -> Vec<DeviceNumber> {
        let mut numbers: Vec<DeviceNumber> = self.devices.iter().map(|e| *e.key()).collect();
        numbers.sort();
        numbers
    }

    /// Counts of live devices and of devices whose worker has exited
    pub fn stats(&self) -> FleetStats {
        let mut devices: BTreeMap<DeviceNumber, DeviceStats> = self
            .retired
            .iter()
            .map(|e| (*e.key(), e.value().snapshot()))
            .collect();
        for entry in self.devices.iter() {
            devices.insert(*entry.key(), entry.value().counters.snapshot());
        }
        FleetStats { devices }
    }

    /// Queue a tick for every idle device; returns how many were queued
    pub fn schedule_round(&self) -> usize {
        let mut scheduled = 0;
        for entry in self.devices.iter() {
            let device = entry.key().0;
            let handle = entry.value();

            if handle.busy.swap(true, Ordering::AcqRel) {
                handle.counters.record_skip();
                debug!(device, "previous tick still running, skipped");
                continue;
            }

            match handle.inbox.try_send(DeviceMessage::Tick) {
                Ok(()) => scheduled += 1,
                Err(err) => {
                    handle.busy.store(false, Ordering::Release);
                    handle.counters.record_skip();
                    warn!(device, error = %err, "tick not queued");
                }
            }
        }
        scheduled
    }

    /// Drop devices whose worker has exited
    async fn reap(&self) {
        let finished: Vec<DeviceNumber> = self
            .devices
            .iter()
            .filter(|e| e.value().task.is_finished())
            .map(|e| *e.key())
            .collect();

        for number in finished {
            if let Some((_, handle)) = self.devices.remove(&number) {
                self.retired.insert(number, handle.counters);
                match handle.task.await {
                    Err(err) if err.is_panic() => {
                        error!(device = number.0, "device worker panicked, device removed")
                    }
                    _ => warn!(device = number.0, "device worker exited, device removed"),
                }
            }
        }
    }

    /// Schedule ticks until `shutdown` fires, then stop every worker
    pub async fn run(&self, shutdown: CancellationToken) -> FleetStats {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    self.reap().await;
                    if self.devices.is_empty() {
                        error!("no device workers left");
                        break;
                    }
                    let scheduled = self.schedule_round();
                    debug!(scheduled, "tick round");
                }
            }
        }

        self.shutdown().await
    }

    /// Stop every worker and release every session
    ///
    /// Workers first get the grace period to finish the message in hand.
    /// Stragglers are then interrupted and close their sessions; a worker
    /// that cannot close within [`CLOSE_TIMEOUT`] is aborted.
    pub async fn shutdown(&self) -> FleetStats {
        self.cancel.cancel();

        let numbers: Vec<DeviceNumber> = self.devices.iter().map(|e| *e.key()).collect();
        let mut tasks = Vec::with_capacity(numbers.len());
        for number in numbers {
            if let Some((_, handle)) = self.devices.remove(&number) {
                self.retired.insert(number, handle.counters);
                tasks.push(handle.task);
            }
        }

        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let mut workers = std::pin::pin!(join_all(tasks));
        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, workers.as_mut()).await.is_err() {
            warn!(?grace, "workers still running after grace period, interrupting");
            self.halt.cancel();
            if tokio::time::timeout(CLOSE_TIMEOUT, workers.as_mut()).await.is_err() {
                error!(timeout = ?CLOSE_TIMEOUT, "workers did not close their sessions, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        let stats = self.stats();
        let total = stats.total();
        info!(
            completed = total.completed,
            failed = total.failed,
            skipped = total.skipped,
            "fleet stopped"
        );
        stats
    }
}

async fn open_device(
    config: &FleetConfig,
    device: &DeviceConfig,
    instrument: &dyn InstrumentClient,
    cloud: &dyn CloudConnector,
) -> Result<OpenedDevice, SyncError> {
    let number = device.number;
    let init_failed = |source: InitializationCause| SyncError::Initialization {
        device: number,
        source,
    };

    let channel = cloud
        .open(&device.connection)
        .await
        .map_err(|err| init_failed(err.into()))?;

    let identity = DeviceIdentity {
        number,
        endpoint: config.endpoint.clone(),
        cloud: channel.clone(),
    };
    let connected = DeviceSession::connect(identity, instrument, config.session.clone()).await;
    let session = match connected {
        Ok(session) => session,
        Err(err) => {
            channel.close().await;
            return Err(err);
        }
    };

    let (inbox, receiver) = mpsc::channel(config.inbox_capacity);
    let commands = session.dispatcher().command_names();
    if let Err(err) = bind_handlers(channel.as_ref(), &commands, &inbox).await {
        session.close().await;
        return Err(init_failed(err.into()));
    }

    session.report_launch().await;

    Ok(OpenedDevice {
        session,
        inbox,
        receiver,
    })
}

fn spawn_worker(
    opened: OpenedDevice,
    cancel: &CancellationToken,
    halt: &CancellationToken,
) -> DeviceHandle {
    let busy = Arc::new(AtomicBool::new(false));
    let counters = Arc::new(TickCounters::default());
    let worker = DeviceWorker {
        session: opened.session,
        inbox: opened.receiver,
        busy: busy.clone(),
        counters: counters.clone(),
        cancel: cancel.child_token(),
        halt: halt.child_token(),
    };

    DeviceHandle {
        inbox: opened.inbox,
        busy,
        counters,
        task: tokio::spawn(worker.run()),
    }
}
