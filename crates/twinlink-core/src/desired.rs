//! Application of cloud desired properties to the instrument

use crate::device::{DeviceNumber, Metric};
use crate::error::InstrumentError;
use crate::instrument::InstrumentSession;
use crate::twin::{DesiredProperties, PRODUCTION_RATE};
use crate::value::NodeValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// When the twin learns about a setpoint that was just applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcilePolicy {
    /// Re-read the setpoint and patch the twin right after applying it
    #[default]
    Immediate,
    /// Leave it to the next scheduled tick
    NextTick,
}

/// What a desired-properties notification changed on the instrument
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedDesired {
    pub production_rate: Option<NodeValue>,
    pub ignored: Vec<String>,
}

impl AppliedDesired {
    pub fn wrote_anything(&self) -> bool {
        self.production_rate.is_some()
    }
}

/// Writes desired setpoints of one device
#[derive(Debug, Clone)]
pub struct DesiredStateApplier {
    device: DeviceNumber,
    policy: ReconcilePolicy,
}

impl DesiredStateApplier {
    pub fn new(device: DeviceNumber, policy: ReconcilePolicy) -> Self {
        Self { device, policy }
    }

    pub fn policy(&self) -> ReconcilePolicy {
        self.policy
    }

    /// Write every recognized property; unknown names are skipped
    pub async fn apply(
        &self,
        instrument: &dyn InstrumentSession,
        desired: &DesiredProperties,
    ) -> Result<AppliedDesired, InstrumentError> {
        let mut applied = AppliedDesired::default();

        for (name, value) in &desired.properties {
            if name != PRODUCTION_RATE {
                debug!(device = self.device.0, property = %name, "ignoring desired property");
                applied.ignored.push(name.clone());
                continue;
            }

            let numeric = NodeValue::from_json(value)
                .filter(|v| matches!(v, NodeValue::Integer(_) | NodeValue::Float(_)));
            let Some(rate) = numeric else {
                warn!(device = self.device.0, %value, "desired productionRate is not a number");
                applied.ignored.push(name.clone());
                continue;
            };

            info!(device = self.device.0, requested = %rate, "applying desired production rate");
            instrument
                .write_setpoint(self.device, Metric::ProductionRate, rate.clone())
                .await?;
            applied.production_rate = Some(rate);
        }

        Ok(applied)
    }
}
