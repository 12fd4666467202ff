//! Integration tests for the device session cycle

use serde_json::json;
use std::sync::Arc;
use twinlink_core::memory::{MemoryChannel, MemoryInstrument};
use twinlink_core::twin::{ERROR_MASK, LAST_APP_LAUNCH, LAST_DESIRED_CHANGE, PRODUCTION_RATE};
use twinlink_core::{
    DesiredProperties, DeviceEvent, DeviceIdentity, DeviceNumber, DeviceSession, ErrorFlags,
    Metric, NodeValue, ReconcilePolicy, SessionConfig, SyncError, Twin,
};

const ENDPOINT: &str = "opc.tcp://localhost:4840/";

async fn open(
    device: DeviceNumber,
    config: SessionConfig,
) -> (DeviceSession, MemoryInstrument, Arc<MemoryChannel>) {
    let plant = MemoryInstrument::new();
    plant.add_device(device);
    plant.set(device, Metric::ProductionRate, 10);
    let channel = Arc::new(MemoryChannel::new(format!("line-{}", device.0)));
    let identity = DeviceIdentity {
        number: device,
        endpoint: ENDPOINT.to_string(),
        cloud: channel.clone(),
    };
    let session = DeviceSession::connect(identity, &plant, config).await.unwrap();
    (session, plant, channel)
}

fn set_readings(
    plant: &MemoryInstrument,
    device: DeviceNumber,
    rate: i64,
    good: i64,
    bad: i64,
    err: i64,
    temp: f64,
) {
    plant.set(device, Metric::ProductionStatus, "Running");
    plant.set(device, Metric::ProductionRate, rate);
    plant.set(device, Metric::GoodCount, good);
    plant.set(device, Metric::BadCount, bad);
    plant.set(device, Metric::DeviceError, err);
    plant.set(device, Metric::Temperature, temp);
}

#[tokio::test]
async fn test_baseline_seeds_state() {
    let (session, _plant, _channel) = open(DeviceNumber(1), SessionConfig::default()).await;
    let state = session.state();
    assert_eq!(state.production_rate, 10.0);
    assert_eq!(state.good_count, 0);
    assert_eq!(state.bad_count, 0);
    assert_eq!(state.error_flags, ErrorFlags::empty());
}

#[tokio::test]
async fn test_first_and_repeated_tick() {
    let device = DeviceNumber(1);
    let (mut session, plant, channel) = open(device, SessionConfig::default()).await;
    set_readings(&plant, device, 12, 5, 1, 1, 85.0);

    session.tick().await.unwrap();

    let events = channel.events();
    assert_eq!(events.len(), 2);
    let DeviceEvent::Telemetry(telemetry) = &events[0] else {
        panic!("telemetry must come first, got {:?}", events[0]);
    };
    assert_eq!(telemetry.production_status, "Running");
    assert_eq!(telemetry.good_delta, 5);
    assert_eq!(telemetry.bad_delta, 1);
    assert!(telemetry.temperature_alert);

    let DeviceEvent::Error(error) = &events[1] else {
        panic!("expected error event, got {:?}", events[1]);
    };
    assert_eq!(error.error_mask, 1);
    assert!(error.emergency_stop);
    assert!(!error.power_failure && !error.sensor_failure && !error.unknown_failure);

    let messages = channel.messages();
    assert_eq!(messages[0].properties["temperatureAlert"], "true");
    assert_eq!(messages[0].content_type, "application/json");

    let patches = channel.patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0][PRODUCTION_RATE], json!(12.0));
    assert_eq!(patches[0][ERROR_MASK], json!(1));

    // Identical readings: zero deltas, no error event, no patch call
    channel.clear();
    session.tick().await.unwrap();

    let events = channel.events();
    assert_eq!(events.len(), 1);
    let DeviceEvent::Telemetry(telemetry) = &events[0] else {
        panic!("expected telemetry, got {:?}", events[0]);
    };
    assert_eq!(telemetry.good_delta, 0);
    assert_eq!(telemetry.bad_delta, 0);
    assert!(channel.patches().is_empty());
}

#[tokio::test]
async fn test_failed_publish_does_not_advance_state() {
    let device = DeviceNumber(2);
    let (mut session, plant, channel) = open(device, SessionConfig::default()).await;
    let before = session.state();

    set_readings(&plant, device, 10, 7, 0, 0, 20.0);
    channel.set_fail_events(true);
    let err = session.tick().await.unwrap_err();
    assert!(matches!(err, SyncError::Publish { .. }));
    assert_eq!(session.state(), before);

    // More production happened meanwhile; the delta covers both ticks
    set_readings(&plant, device, 10, 9, 0, 0, 20.0);
    channel.set_fail_events(false);
    let outcome = session.tick().await.unwrap();
    assert_eq!(outcome.telemetry.good_delta, 9);
    assert_eq!(session.state().good_count, 9);
}

#[tokio::test]
async fn test_failed_patch_does_not_advance_state() {
    let device = DeviceNumber(2);
    let (mut session, plant, channel) = open(device, SessionConfig::default()).await;
    let before = session.state();

    set_readings(&plant, device, 30, 1, 0, 4, 20.0);
    channel.set_fail_patches(true);
    assert!(matches!(
        session.tick().await,
        Err(SyncError::Publish { .. })
    ));
    assert_eq!(session.state(), before);

    channel.set_fail_patches(false);
    channel.clear();
    let outcome = session.tick().await.unwrap();
    assert_eq!(outcome.telemetry.good_delta, 1);
    assert!(outcome.error.is_some());
    assert_eq!(channel.patches().len(), 1);
}

#[tokio::test]
async fn test_read_failure_is_a_no_op() {
    let device = DeviceNumber(3);
    let (mut session, plant, channel) = open(device, SessionConfig::default()).await;
    let before = session.state();

    plant.set_failing(device, true);
    let err = session.tick().await.unwrap_err();
    assert!(matches!(err, SyncError::Read { .. }));
    assert_eq!(session.state(), before);
    assert!(channel.events().is_empty());
    assert!(channel.patches().is_empty());
}

#[tokio::test]
async fn test_undecodable_reading_is_a_read_error() {
    let device = DeviceNumber(3);
    let (mut session, plant, channel) = open(device, SessionConfig::default()).await;
    plant.set(device, Metric::GoodCount, "lots");

    assert!(matches!(session.tick().await, Err(SyncError::Read { .. })));
    assert!(channel.events().is_empty());
}

#[tokio::test]
async fn test_mask_wider_than_32_bits_is_a_read_error() {
    let device = DeviceNumber(3);
    let (mut session, plant, channel) = open(device, SessionConfig::default()).await;
    let before = session.state();
    set_readings(&plant, device, 10, 0, 0, 1i64 << 32, 20.0);

    let err = session.tick().await.unwrap_err();
    assert!(matches!(err, SyncError::Read { .. }));
    assert!(err.to_string().contains("DeviceError: mask 4294967296"));
    assert_eq!(session.state(), before);
    assert!(channel.events().is_empty());
    assert!(channel.patches().is_empty());
}

#[tokio::test]
async fn test_initialization_errors() {
    let device = DeviceNumber(4);
    let channel = Arc::new(MemoryChannel::new("line-4"));
    let identity = DeviceIdentity {
        number: device,
        endpoint: ENDPOINT.to_string(),
        cloud: channel,
    };

    // Device not present on the server
    let plant = MemoryInstrument::new();
    let result = DeviceSession::connect(identity.clone(), &plant, SessionConfig::default()).await;
    assert!(matches!(result, Err(SyncError::Initialization { .. })));
    assert_eq!(plant.open_sessions(), 0);

    // Server unreachable
    plant.add_device(device);
    plant.set_unreachable(true);
    let result = DeviceSession::connect(identity, &plant, SessionConfig::default()).await;
    assert!(matches!(result, Err(SyncError::Initialization { .. })));
}

#[tokio::test]
async fn test_launch_report_includes_stale_fields() {
    let device = DeviceNumber(1);
    let (session, _plant, channel) = open(device, SessionConfig::default()).await;
    channel.set_twin(
        serde_json::from_value::<Twin>(json!({
            "reported": {"productionRate": 10.0, "errorMask": 2}
        }))
        .unwrap(),
    );

    session.report_launch().await;

    let patches = channel.patches();
    assert_eq!(patches.len(), 1);
    assert!(patches[0].contains_key(LAST_APP_LAUNCH));
    assert!(!patches[0].contains_key(PRODUCTION_RATE));
    assert_eq!(patches[0][ERROR_MASK], json!(0));
}

#[tokio::test]
async fn test_desired_rate_applied_and_reconciled() {
    let device = DeviceNumber(5);
    let (mut session, plant, channel) = open(device, SessionConfig::default()).await;

    let desired: DesiredProperties =
        serde_json::from_value(json!({"productionRate": 60, "colour": "blue", "$version": 3}))
            .unwrap();
    let applied = session.apply_desired(&desired).await.unwrap();

    assert_eq!(applied.production_rate, Some(NodeValue::from(60)));
    assert_eq!(applied.ignored, vec!["colour".to_string()]);
    assert_eq!(
        plant.writes(device),
        vec![(Metric::ProductionRate, NodeValue::from(60))]
    );

    let patches = channel.patches();
    assert_eq!(patches.len(), 2);
    assert!(patches[0].contains_key(LAST_DESIRED_CHANGE));
    assert_eq!(patches[1][PRODUCTION_RATE], json!(60.0));
    assert_eq!(session.state().production_rate, 60.0);

    // The next tick has nothing new to report for the rate
    channel.clear();
    session.tick().await.unwrap();
    assert!(channel.patches().is_empty());
}

#[tokio::test]
async fn test_desired_rate_waits_for_next_tick() {
    let device = DeviceNumber(5);
    let config = SessionConfig {
        reconcile: ReconcilePolicy::NextTick,
        ..SessionConfig::default()
    };
    let (mut session, _plant, channel) = open(device, config).await;

    let desired: DesiredProperties = serde_json::from_value(json!({"productionRate": 45})).unwrap();
    session.apply_desired(&desired).await.unwrap();
    assert_eq!(channel.patches().len(), 1);
    assert_eq!(session.state().production_rate, 10.0);

    channel.clear();
    session.tick().await.unwrap();
    let patches = channel.patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0][PRODUCTION_RATE], json!(45.0));
}

#[tokio::test]
async fn test_unknown_desired_properties_are_ignored() {
    let device = DeviceNumber(6);
    let (mut session, plant, _channel) = open(device, SessionConfig::default()).await;

    let desired: DesiredProperties =
        serde_json::from_value(json!({"firmware": "2.1", "productionRate": "fast"})).unwrap();
    let applied = session.apply_desired(&desired).await.unwrap();
    assert!(!applied.wrote_anything());
    assert_eq!(applied.ignored.len(), 2);
    assert!(plant.writes(device).is_empty());
}

#[tokio::test]
async fn test_desired_write_failure() {
    let device = DeviceNumber(6);
    let (mut session, plant, channel) = open(device, SessionConfig::default()).await;
    plant.set_failing(device, true);

    let desired: DesiredProperties = serde_json::from_value(json!({"productionRate": 20})).unwrap();
    let err = session.apply_desired(&desired).await.unwrap_err();
    assert!(matches!(err, SyncError::Apply { .. }));
    assert!(channel.patches().is_empty());
}

#[tokio::test]
async fn test_close_releases_sessions() {
    let device = DeviceNumber(7);
    let (session, plant, channel) = open(device, SessionConfig::default()).await;
    assert_eq!(plant.open_sessions(), 1);

    session.close().await;
    assert_eq!(plant.open_sessions(), 0);
    assert!(channel.is_closed());
}
