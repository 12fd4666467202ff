//! Device session: the read-diff-publish-commit cycle of one device
//!
//! A session exclusively owns its instrument session, its cloud channel and
//! its [`DeviceState`]. Nothing else reads or writes that state, so the
//! session needs no locking; the caller serializes access by owning it.

use crate::command::{CommandDispatcher, FallbackPolicy};
use crate::desired::{AppliedDesired, DesiredStateApplier, ReconcilePolicy};
use crate::device::{DeviceIdentity, DeviceNumber, Metric};
use crate::error::{CloudChannelError, InstrumentError, SyncError};
use crate::event::{DeviceEvent, OutboundMessage};
use crate::instrument::{read_baseline, read_snapshot, InstrumentClient, InstrumentSession};
use crate::message::{CloudMessage, CommandRequest, CommandResponse};
use crate::state::{DeviceState, MetricSnapshot, TickOutcome};
use crate::twin::{self, DesiredProperties, TwinPatch};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Default temperature above which telemetry is flagged
pub const DEFAULT_ALERT_THRESHOLD: f64 = 80.0;

/// Behaviour knobs shared by every session of a fleet
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Telemetry is flagged when temperature exceeds this
    pub alert_threshold: f64,

    /// Whether applied desired properties are reported right away
    pub reconcile: ReconcilePolicy,

    /// Handling of commands with no registered handler
    pub fallback: FallbackPolicy,

    /// Enables the `SendMessages` diagnostic command
    pub diagnostics: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            reconcile: ReconcilePolicy::default(),
            fallback: FallbackPolicy::default(),
            diagnostics: false,
        }
    }
}

/// One device's synchronization state machine
pub struct DeviceSession {
    identity: DeviceIdentity,
    instrument: Box<dyn InstrumentSession>,
    state: DeviceState,
    config: SessionConfig,
    dispatcher: CommandDispatcher,
    applier: DesiredStateApplier,
}

impl DeviceSession {
    /// Open the instrument session and seed state from a baseline read
    pub async fn connect(
        identity: DeviceIdentity,
        client: &dyn InstrumentClient,
        config: SessionConfig,
    ) -> Result<Self, SyncError> {
        let device = identity.number;
        let init_failed = |source: InstrumentError| SyncError::Initialization {
            device,
            source: source.into(),
        };

        let instrument = client
            .connect(&identity.endpoint)
            .await
            .map_err(init_failed)?;

        let state = match read_baseline(instrument.as_ref(), device).await {
            Ok(state) => state,
            Err(err) => {
                instrument.disconnect().await;
                return Err(init_failed(err));
            }
        };

        info!(
            device = device.0,
            cloud = identity.cloud.device_id(),
            rate = state.production_rate,
            good = state.good_count,
            bad = state.bad_count,
            errors = state.error_flags.raw(),
            "device session opened"
        );

        Ok(Self {
            dispatcher: CommandDispatcher::new(device, config.fallback, config.diagnostics),
            applier: DesiredStateApplier::new(device, config.reconcile),
            identity,
            instrument,
            state,
            config,
        })
    }

    pub fn number(&self) -> DeviceNumber {
        self.identity.number
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Last committed state
    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    fn cloud(&self) -> &Arc<dyn crate::cloud::CloudChannel> {
        &self.identity.cloud
    }

    fn publish_failed(&self, source: CloudChannelError) -> SyncError {
        SyncError::Publish {
            device: self.number(),
            source,
        }
    }

    /// Fetch the twin, log it and report the launch time
    ///
    /// Baseline fields the twin disagrees with are reported alongside.
    /// Failures are logged and otherwise ignored.
    pub async fn report_launch(&self) {
        let device = self.number().0;
        let stale = match self.cloud().get_twin().await {
            Ok(twin) => {
                info!(
                    device,
                    desired = %serde_json::Value::Object(twin.desired.clone()),
                    reported = %serde_json::Value::Object(twin.reported.clone()),
                    "initial twin received"
                );
                twin.stale_fields(&self.state)
            }
            Err(err) => {
                warn!(device, error = %err, "could not fetch twin");
                TwinPatch::default()
            }
        };

        let report = twin::launch_report(stale, Utc::now());
        if let Err(err) = self.cloud().patch_reported_properties(report).await {
            warn!(device, error = %err, "could not report launch");
        }
    }

    /// Read the current snapshot without touching state
    pub async fn read_snapshot(&self) -> Result<MetricSnapshot, InstrumentError> {
        read_snapshot(self.instrument.as_ref(), self.number()).await
    }

    /// Run one read-diff-publish-commit cycle
    ///
    /// State advances only when every publish of the tick succeeded. On a
    /// failed publish the next tick recomputes deltas against the same
    /// committed state, so a delta may be delivered twice but never lost.
    #[instrument(skip(self), fields(device = self.identity.number.0))]
    pub async fn tick(&mut self) -> Result<TickOutcome, SyncError> {
        let snapshot = self.read_snapshot().await.map_err(|source| SyncError::Read {
            device: self.number(),
            source,
        })?;

        let outcome = self.state.diff(&snapshot, self.config.alert_threshold);
        self.publish(&outcome)
            .await
            .map_err(|source| self.publish_failed(source))?;

        self.state = DeviceState::observed(&snapshot);
        debug!(state = ?self.state, "state committed");
        Ok(outcome)
    }

    async fn publish(&self, outcome: &TickOutcome) -> Result<(), CloudChannelError> {
        let telemetry = DeviceEvent::Telemetry(outcome.telemetry.clone());
        self.cloud()
            .publish_event(OutboundMessage::encode(&telemetry)?)
            .await?;
        info!(%telemetry, "event sent");

        if let Some(error) = &outcome.error {
            let event = DeviceEvent::Error(error.clone());
            self.cloud()
                .publish_event(OutboundMessage::encode(&event)?)
                .await?;
            info!(%event, "event sent");
        }

        if !outcome.patch.is_empty() {
            self.cloud()
                .patch_reported_properties(outcome.patch.to_reported())
                .await?;
            info!(patch = ?outcome.patch, "twin patched");
        }

        Ok(())
    }

    /// Execute a cloud command against this device's instrument
    pub async fn handle_command(&self, request: &CommandRequest) -> CommandResponse {
        self.dispatcher
            .dispatch(self.instrument.as_ref(), self.cloud().as_ref(), request)
            .await
    }

    /// Write desired setpoints, acknowledge the change and optionally reconcile
    pub async fn apply_desired(
        &mut self,
        desired: &DesiredProperties,
    ) -> Result<AppliedDesired, SyncError> {
        info!(
            device = self.number().0,
            version = ?desired.version,
            properties = %serde_json::Value::Object(desired.properties.clone()),
            "desired property change"
        );

        let applied = self
            .applier
            .apply(self.instrument.as_ref(), desired)
            .await
            .map_err(|source| SyncError::Apply {
                device: self.number(),
                source,
            })?;

        self.cloud()
            .patch_reported_properties(twin::desired_change_report(Utc::now()))
            .await
            .map_err(|source| self.publish_failed(source))?;

        if applied.wrote_anything() && self.applier.policy() == ReconcilePolicy::Immediate {
            self.reconcile_production_rate().await?;
        }

        Ok(applied)
    }

    /// Re-read the production rate and report it if the twin has not seen it
    ///
    /// Only the production rate is advanced; error transitions are left to
    /// the next tick so their events are not skipped.
    pub async fn reconcile_production_rate(&mut self) -> Result<Option<f64>, SyncError> {
        let device = self.number();
        let values = self
            .instrument
            .read_metrics(device, &[Metric::ProductionRate])
            .await
            .map_err(|source| SyncError::Read { device, source })?;

        let rate = values.first().and_then(|v| v.as_f64()).ok_or_else(|| SyncError::Read {
            device,
            source: InstrumentError::new(
                self.instrument.endpoint(),
                "decode production rate",
                "expected one numeric value",
            ),
        })?;

        if rate == self.state.production_rate {
            return Ok(None);
        }

        let patch = TwinPatch {
            production_rate: Some(rate),
            error_mask: None,
        };
        self.cloud()
            .patch_reported_properties(patch.to_reported())
            .await
            .map_err(|source| self.publish_failed(source))?;

        self.state.production_rate = rate;
        info!(device = device.0, rate, "production rate reconciled");
        Ok(Some(rate))
    }

    /// Log a cloud-to-device message
    pub fn receive_message(&self, message: &CloudMessage) {
        info!(
            device = self.number().0,
            id = %message.message_id,
            body = %String::from_utf8_lossy(&message.body),
            properties = ?message.properties,
            "cloud message received"
        );
    }

    /// Release the instrument session and the cloud channel
    pub async fn close(self) {
        self.instrument.disconnect().await;
        self.identity.cloud.close().await;
        info!(device = self.identity.number.0, "device session closed");
    }
}
