//! Simulated production line
//!
//! Drives the in-memory plant so the bridge has something to report:
//! running devices produce parts at their production rate and drift in
//! temperature. A device stopped by an emergency stop stays down until its
//! errors are reset.

use crate::config::SimulationSection;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use twinlink_core::memory::MemoryInstrument;
use twinlink_core::{DeviceNumber, Metric};

const RUNNING: i64 = 1;

pub struct PlantSimulator {
    plant: MemoryInstrument,
    devices: Vec<DeviceNumber>,
    settings: SimulationSection,
    step: u64,
}

impl PlantSimulator {
    /// Add `devices` to `plant` and take over their values
    pub fn new(
        plant: MemoryInstrument,
        devices: Vec<DeviceNumber>,
        settings: SimulationSection,
    ) -> Self {
        for device in &devices {
            plant.add_device(*device);
        }
        Self {
            plant,
            devices,
            settings,
            step: 0,
        }
    }

    fn integer(&self, device: DeviceNumber, metric: Metric) -> i64 {
        self.plant
            .get(device, metric)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    /// Advance every device by one step
    pub fn step(&mut self) {
        self.step += 1;
        for device in &self.devices {
            self.advance(*device);
        }
    }

    fn advance(&self, device: DeviceNumber) {
        if self.integer(device, Metric::ProductionStatus) != RUNNING {
            if self.integer(device, Metric::DeviceError) == 0 {
                self.plant.set(device, Metric::ProductionStatus, RUNNING);
                info!(device = device.0, "line restarted");
            }
            return;
        }

        let rate = self
            .plant
            .get(device, Metric::ProductionRate)
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let parts = (rate / 10.0).round().max(0.0) as i64;
        let every = self.settings.bad_part_every;
        let bad_step = every > 0 && self.step % every == 0;
        let bad = if bad_step && parts > 0 { 1 } else { 0 };

        let good_count = self.integer(device, Metric::GoodCount) + parts - bad;
        let bad_count = self.integer(device, Metric::BadCount) + bad;
        self.plant.set(device, Metric::GoodCount, good_count);
        self.plant.set(device, Metric::BadCount, bad_count);

        let phase = (self.step as f64 + f64::from(device.0) * 3.0) / 8.0;
        let temperature = ((60.0 + 25.0 * phase.sin()) * 10.0).round() / 10.0;
        self.plant.set(device, Metric::Temperature, temperature);

        debug!(device = device.0, good_count, bad_count, temperature, "plant step");
    }

    /// Step the plant every `step_ms` until cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        let step = Duration::from_millis(self.settings.step_ms.max(1));
        let mut interval = tokio::time::interval(step);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; leave the baseline alone
        interval.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => self.step(),
            }
        }
        debug!(steps = self.step, "simulation stopped");
    }
}
