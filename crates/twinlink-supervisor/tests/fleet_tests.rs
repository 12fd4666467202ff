//! Fleet scheduling, isolation and shutdown against the in-memory plant

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use twinlink_core::memory::{MemoryCloud, MemoryInstrument};
use twinlink_core::twin::{LAST_APP_LAUNCH, PRODUCTION_RATE};
use twinlink_core::{
    Action, CloudMessage, DesiredProperties, DeviceEvent, DeviceNumber, InstrumentClient,
    InstrumentError, InstrumentSession, Metric, NodeValue,
};
use twinlink_supervisor::{DeviceConfig, Fleet, FleetConfig, FleetError, FleetStats};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("twinlink_core=debug,twinlink_supervisor=debug")
        .with_test_writer()
        .try_init();
}

fn config(devices: &[u32]) -> FleetConfig {
    FleetConfig {
        poll_interval: Duration::from_secs(1),
        shutdown_grace: Duration::from_secs(5),
        devices: devices
            .iter()
            .map(|n| DeviceConfig {
                number: DeviceNumber(*n),
                connection: format!(
                    "HostName=hub.example.net;DeviceId=line-{n};SharedAccessKey=a2V5"
                )
                .parse()
                .unwrap(),
            })
            .collect(),
        ..FleetConfig::default()
    }
}

fn plant(devices: &[u32]) -> MemoryInstrument {
    let plant = MemoryInstrument::new();
    for n in devices {
        plant.add_device(DeviceNumber(*n));
    }
    plant
}

async fn start(
    devices: &[u32],
    plant: &MemoryInstrument,
    cloud: &MemoryCloud,
) -> Result<Arc<Fleet>, FleetError> {
    init_tracing();
    let instrument = Arc::new(plant.clone());
    let fleet = Fleet::start(config(devices), instrument, Arc::new(cloud.clone())).await?;
    Ok(Arc::new(fleet))
}

/// Run the fleet for `duration` of virtual time, then shut it down
async fn run_for(fleet: &Arc<Fleet>, duration: Duration) -> FleetStats {
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn({
        let fleet = fleet.clone();
        let shutdown = shutdown.clone();
        async move { fleet.run(shutdown).await }
    });
    tokio::time::sleep(duration).await;
    shutdown.cancel();
    runner.await.unwrap()
}

/// Plant whose driver panics while reading a full snapshot of some devices
struct CrashingInstrument {
    plant: MemoryInstrument,
    crashing: Vec<DeviceNumber>,
}

struct CrashingSession {
    inner: Box<dyn InstrumentSession>,
    crashing: Vec<DeviceNumber>,
}

#[async_trait]
impl InstrumentClient for CrashingInstrument {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn InstrumentSession>, InstrumentError> {
        Ok(Box::new(CrashingSession {
            inner: self.plant.connect(endpoint).await?,
            crashing: self.crashing.clone(),
        }))
    }
}

#[async_trait]
impl InstrumentSession for CrashingSession {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn read_metrics(
        &self,
        device: DeviceNumber,
        metrics: &[Metric],
    ) -> Result<Vec<NodeValue>, InstrumentError> {
        if self.crashing.contains(&device) && metrics.len() == Metric::SNAPSHOT.len() {
            panic!("driver crashed reading {device}");
        }
        self.inner.read_metrics(device, metrics).await
    }

    async fn invoke_action(
        &self,
        device: DeviceNumber,
        action: Action,
    ) -> Result<(), InstrumentError> {
        self.inner.invoke_action(device, action).await
    }

    async fn write_setpoint(
        &self,
        device: DeviceNumber,
        metric: Metric,
        value: NodeValue,
    ) -> Result<(), InstrumentError> {
        self.inner.write_setpoint(device, metric, value).await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await
    }
}

async fn start_crashing(devices: &[u32], crashing: &[u32], cloud: &MemoryCloud) -> Arc<Fleet> {
    init_tracing();
    let instrument = CrashingInstrument {
        plant: plant(devices),
        crashing: crashing.iter().map(|n| DeviceNumber(*n)).collect(),
    };
    let fleet = Fleet::start(config(devices), Arc::new(instrument), Arc::new(cloud.clone()))
        .await
        .unwrap();
    Arc::new(fleet)
}

fn good_deltas(cloud: &MemoryCloud, device_id: &str) -> i64 {
    cloud
        .channel(device_id)
        .unwrap()
        .events()
        .iter()
        .filter_map(|event| match event {
            DeviceEvent::Telemetry(t) => Some(t.good_delta),
            _ => None,
        })
        .sum()
}

#[tokio::test(start_paused = true)]
async fn test_ticks_reach_every_device() {
    let plant = plant(&[1, 2, 3]);
    let cloud = MemoryCloud::new();
    let fleet = start(&[1, 2, 3], &plant, &cloud).await.unwrap();
    assert_eq!(
        fleet.devices(),
        vec![DeviceNumber(1), DeviceNumber(2), DeviceNumber(3)]
    );

    plant.set(DeviceNumber(2), Metric::GoodCount, 4);
    let stats = run_for(&fleet, Duration::from_millis(3500)).await;

    assert_eq!(stats.devices.len(), 3);
    for device in stats.devices.values() {
        assert!(device.completed >= 3, "too few ticks: {device:?}");
        assert_eq!(device.failed, 0);
        assert_eq!(device.skipped, 0);
    }

    // Every unit of production is reported exactly once
    assert_eq!(good_deltas(&cloud, "line-2"), 4);
    assert_eq!(good_deltas(&cloud, "line-1"), 0);

    let patches = cloud.channel("line-1").unwrap().patches();
    assert!(patches[0].contains_key(LAST_APP_LAUNCH));
}

#[tokio::test(start_paused = true)]
async fn test_failing_device_does_not_stall_others() {
    let plant = plant(&[1, 2, 3]);
    let cloud = MemoryCloud::new();
    let fleet = start(&[1, 2, 3], &plant, &cloud).await.unwrap();

    plant.set_failing(DeviceNumber(2), true);
    let stats = run_for(&fleet, Duration::from_millis(2500)).await;

    let failing = stats.devices[&DeviceNumber(2)];
    assert_eq!(failing.completed, 0);
    assert!(failing.failed >= 2);
    assert!(cloud.channel("line-2").unwrap().events().is_empty());

    for n in [1, 3] {
        let healthy = stats.devices[&DeviceNumber(n)];
        assert!(healthy.completed >= 2);
        assert_eq!(healthy.failed, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_busy_device_is_skipped() {
    let plant = plant(&[1, 2]);
    let cloud = MemoryCloud::new();
    let fleet = start(&[1, 2], &plant, &cloud).await.unwrap();

    // Each read of device 1 outlasts two scheduling rounds
    plant.set_read_delay(DeviceNumber(1), Duration::from_millis(2500));
    let stats = run_for(&fleet, Duration::from_millis(6500)).await;

    let slow = stats.devices[&DeviceNumber(1)];
    let fast = stats.devices[&DeviceNumber(2)];
    assert!(slow.skipped >= 2, "slow device never skipped: {slow:?}");
    assert!(slow.completed + slow.skipped <= 7);
    assert!(fast.completed >= 6);
    assert_eq!(fast.skipped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_sessions() {
    let plant = plant(&[1, 2]);
    let cloud = MemoryCloud::new();
    let fleet = start(&[1, 2], &plant, &cloud).await.unwrap();
    assert_eq!(plant.open_sessions(), 2);

    run_for(&fleet, Duration::from_millis(1500)).await;

    assert_eq!(plant.open_sessions(), 0);
    assert!(cloud.channel("line-1").unwrap().is_closed());
    assert!(cloud.channel("line-2").unwrap().is_closed());
    assert!(fleet.devices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_stuck_worker_after_grace() {
    let plant = plant(&[1, 2]);
    let cloud = MemoryCloud::new();
    init_tracing();
    let config = FleetConfig {
        shutdown_grace: Duration::from_millis(500),
        ..config(&[1, 2])
    };
    let fleet = Arc::new(
        Fleet::start(config, Arc::new(plant.clone()), Arc::new(cloud.clone()))
            .await
            .unwrap(),
    );

    plant.set_read_delay(DeviceNumber(1), Duration::from_secs(30));
    let started = tokio::time::Instant::now();
    let stats = run_for(&fleet, Duration::from_millis(1500)).await;

    // Device 1 was interrupted mid-read and still released its session
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(plant.open_sessions(), 0);
    assert!(cloud.channel("line-1").unwrap().is_closed());
    assert!(cloud.channel("line-2").unwrap().is_closed());
    assert_eq!(stats.devices[&DeviceNumber(1)].completed, 0);
    assert!(stats.devices[&DeviceNumber(2)].completed >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_panicked_worker_is_reaped() {
    let cloud = MemoryCloud::new();
    let fleet = start_crashing(&[1, 2, 3], &[2], &cloud).await;

    let shutdown = CancellationToken::new();
    let runner = tokio::spawn({
        let fleet = fleet.clone();
        let shutdown = shutdown.clone();
        async move { fleet.run(shutdown).await }
    });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(fleet.devices(), vec![DeviceNumber(1), DeviceNumber(3)]);
    assert!(fleet.stats().devices.contains_key(&DeviceNumber(2)));

    tokio::time::sleep(Duration::from_secs(2)).await;
    shutdown.cancel();
    let stats = runner.await.unwrap();

    assert_eq!(stats.devices.len(), 3);
    assert_eq!(stats.devices[&DeviceNumber(2)].completed, 0);
    for n in [1, 3] {
        assert!(stats.devices[&DeviceNumber(n)].completed >= 3);
    }
    assert!(cloud.channel("line-2").unwrap().events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_ends_when_every_worker_is_gone() {
    let cloud = MemoryCloud::new();
    let fleet = start_crashing(&[1, 2], &[1, 2], &cloud).await;

    let stats = tokio::time::timeout(Duration::from_secs(10), fleet.run(CancellationToken::new()))
        .await
        .expect("run must end once no workers are left");

    assert!(fleet.devices().is_empty());
    assert_eq!(
        stats.devices.keys().copied().collect::<Vec<_>>(),
        vec![DeviceNumber(1), DeviceNumber(2)]
    );
    assert_eq!(stats.total().completed, 0);
}

#[tokio::test]
async fn test_commands_run_on_the_device_worker() {
    let plant = plant(&[1]);
    let cloud = MemoryCloud::new();
    let fleet = start(&[1], &plant, &cloud).await.unwrap();
    let channel = cloud.channel("line-1").unwrap();
    assert_eq!(channel.command_names(), vec!["EmergencyStop", "ResetErrorStatus"]);

    let response = channel.invoke_command("EmergencyStop", Json::Null).await;
    assert_eq!(response.status, 200);
    assert_eq!(plant.actions(DeviceNumber(1)), vec![Action::EmergencyStop]);

    let response = channel.invoke_command("Foo", Json::Null).await;
    assert_eq!(response.status, 400);

    fleet.shutdown().await;
    let response = channel.invoke_command("ResetErrorStatus", Json::Null).await;
    assert_eq!(response.status, 503);
}

#[tokio::test(start_paused = true)]
async fn test_desired_properties_and_messages_are_delivered() {
    let plant = plant(&[1]);
    let cloud = MemoryCloud::new();
    let fleet = start(&[1], &plant, &cloud).await.unwrap();
    let channel = cloud.channel("line-1").unwrap();
    channel.clear();

    let desired: DesiredProperties =
        serde_json::from_value(json!({"productionRate": 60, "$version": 2})).unwrap();
    assert!(channel.push_desired(desired).await);
    assert!(
        channel
            .push_message(CloudMessage {
                message_id: "m-1".into(),
                body: b"hello".to_vec(),
                properties: BTreeMap::new(),
            })
            .await
    );

    // Let the worker drain its inbox
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        plant.writes(DeviceNumber(1)),
        vec![(Metric::ProductionRate, NodeValue::from(60))]
    );
    let patches = channel.patches();
    assert!(patches.iter().any(|p| p.get(PRODUCTION_RATE) == Some(&json!(60.0))));

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_failed_devices_are_excluded() {
    let plant = plant(&[1, 3]);
    let cloud = MemoryCloud::new();
    cloud.refuse("line-2");

    // Device 4 is not on the server, device 2 is refused by the cloud
    let fleet = start(&[1, 2, 3, 4], &plant, &cloud).await.unwrap();
    assert_eq!(fleet.devices(), vec![DeviceNumber(1), DeviceNumber(3)]);
    assert_eq!(plant.open_sessions(), 2);
    assert!(cloud.channel("line-4").unwrap().is_closed());

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_no_devices() {
    let plant = plant(&[]);
    let cloud = MemoryCloud::new();

    let err = start(&[1, 2], &plant, &cloud).await.err().unwrap();
    assert!(matches!(err, FleetError::NoDevices { failed: 2 }));
    assert_eq!(plant.open_sessions(), 0);
}

#[tokio::test]
async fn test_invalid_config_starts_nothing() {
    let plant = plant(&[1]);
    let cloud = MemoryCloud::new();

    let err = start(&[1, 1], &plant, &cloud).await.err().unwrap();
    assert!(matches!(err, FleetError::Configuration(_)));
    assert_eq!(plant.open_sessions(), 0);
    assert!(cloud.channel("line-1").is_none());
}
