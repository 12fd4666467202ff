//! Per-device worker task
//!
//! The worker is the only owner of a [`DeviceSession`]. Scheduled ticks,
//! commands, desired-property changes and cloud messages all arrive in one
//! inbox and are handled one at a time, which serializes every instrument
//! access for the device.

use futures::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twinlink_core::cloud::{CommandHandler, DesiredPropertyHandler, MessageHandler};
use twinlink_core::{
    CloudChannel, CloudChannelError, CloudMessage, CommandRequest, CommandResponse,
    DesiredProperties, DeviceMessage, DeviceSession,
};

/// Tick outcome counters of one device
#[derive(Debug, Default)]
pub struct TickCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl TickCounters {
    pub(crate) fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeviceStats {
        DeviceStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Tick outcome counts of one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

pub(crate) struct DeviceWorker {
    pub(crate) session: DeviceSession,
    pub(crate) inbox: mpsc::Receiver<DeviceMessage>,
    pub(crate) busy: Arc<AtomicBool>,
    pub(crate) counters: Arc<TickCounters>,
    pub(crate) cancel: CancellationToken,
    /// Interrupts the message in hand; the session is still closed
    pub(crate) halt: CancellationToken,
}

impl DeviceWorker {
    /// Handle inbox messages until cancelled, then release the session
    pub(crate) async fn run(mut self) {
        let device = self.session.number();
        debug!(device = device.0, "worker started");

        let halt = self.halt.clone();
        loop {
            let message = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                message = self.inbox.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            tokio::select! {
                biased;
                () = halt.cancelled() => {
                    warn!(device = device.0, "in-flight work interrupted");
                    break;
                }
                () = self.handle(message) => {}
            }
        }

        self.session.close().await;
        debug!(device = device.0, "worker stopped");
    }

    async fn handle(&mut self, message: DeviceMessage) {
        let device = self.session.number().0;
        match message {
            DeviceMessage::Tick => {
                match self.session.tick().await {
                    Ok(_) => {
                        self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(device, error = %err, "tick failed");
                    }
                }
                self.busy.store(false, Ordering::Release);
            }
            DeviceMessage::Command { request, reply } => {
                let response = self.session.handle_command(&request).await;
                info!(
                    device,
                    command = %request.name,
                    status = response.status,
                    "command answered"
                );
                if reply.send(response).is_err() {
                    debug!(device, "command caller went away");
                }
            }
            DeviceMessage::DesiredProperties(desired) => {
                if let Err(err) = self.session.apply_desired(&desired).await {
                    warn!(device, error = %err, "desired properties not applied");
                }
            }
            DeviceMessage::CloudMessage(message) => self.session.receive_message(&message),
        }
    }
}

/// Route every cloud callback of a device into its inbox
pub(crate) async fn bind_handlers(
    cloud: &dyn CloudChannel,
    commands: &[&str],
    inbox: &mpsc::Sender<DeviceMessage>,
) -> Result<(), CloudChannelError> {
    let handler = command_handler(inbox.clone());
    for name in commands {
        cloud.register_command_handler(name, handler.clone()).await?;
    }
    cloud.register_default_command_handler(handler).await?;
    cloud
        .register_desired_property_handler(desired_handler(inbox.clone()))
        .await?;
    cloud
        .register_message_handler(message_handler(inbox.clone()))
        .await?;
    Ok(())
}

fn command_handler(inbox: mpsc::Sender<DeviceMessage>) -> CommandHandler {
    Arc::new(move |request: CommandRequest| {
        let inbox = inbox.clone();
        async move {
            let (message, reply) = DeviceMessage::command(request);
            if inbox.send(message).await.is_err() {
                return CommandResponse::unavailable();
            }
            reply.await.unwrap_or_else(|_| CommandResponse::unavailable())
        }
        .boxed()
    })
}

fn desired_handler(inbox: mpsc::Sender<DeviceMessage>) -> DesiredPropertyHandler {
    Arc::new(move |desired: DesiredProperties| {
        let inbox = inbox.clone();
        async move {
            if inbox
                .send(DeviceMessage::DesiredProperties(desired))
                .await
                .is_err()
            {
                warn!("desired property change dropped, device worker gone");
            }
        }
        .boxed()
    })
}

fn message_handler(inbox: mpsc::Sender<DeviceMessage>) -> MessageHandler {
    Arc::new(move |message: CloudMessage| {
        let inbox = inbox.clone();
        async move {
            if inbox.send(DeviceMessage::CloudMessage(message)).await.is_err() {
                warn!("cloud message dropped, device worker gone");
            }
        }
        .boxed()
    })
}
