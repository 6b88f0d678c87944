mod common;

use std::time::Duration;

use common::FakeBroker;
use relayd_core::{CommandAction, CommandEnvelope, Presence};
use relayd_mqtt::{MqttError, ObservedPower, OneShotClient, SessionConfig};

fn client(connector: std::sync::Arc<dyn relayd_mqtt::Connector>) -> OneShotClient {
    OneShotClient::new(connector, SessionConfig::default(), Duration::from_secs(5))
}

#[tokio::test(start_paused = true)]
async fn test_publish_once_connects_publishes_and_leaves() {
    let (connector, broker) = FakeBroker::start();
    let client = client(connector);

    client.publish_once("cmnd/plug/POWER", "OFF").await.unwrap();

    assert_eq!(broker.connects(), 1);
    assert_eq!(
        broker.published(),
        vec![("cmnd/plug/POWER".to_string(), "OFF".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_publish_command_uses_first_target_only() {
    let (connector, broker) = FakeBroker::start();
    let client = client(connector);

    let envelope = CommandEnvelope::new("strip", CommandAction::On, "req-7").with_channel("POWER3");
    client.publish_command(&envelope).await.unwrap();

    assert_eq!(
        broker.published(),
        vec![("cmnd/strip/POWER3".to_string(), "ON".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_connack_is_reported() {
    let (connector, broker) = FakeBroker::start();
    broker.reject_with(4);

    let err = client(connector)
        .publish_once("cmnd/plug/POWER", "ON")
        .await
        .unwrap_err();
    assert!(matches!(err, MqttError::ConnectionRejected(4)));
    assert!(broker.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_puback_times_out() {
    let (connector, broker) = FakeBroker::start();
    broker.withhold_ack("cmnd/plug/POWER");

    let err = client(connector)
        .publish_once("cmnd/plug/POWER", "ON")
        .await
        .unwrap_err();
    match err {
        MqttError::PublishTimeout { topic } => assert_eq!(topic, "cmnd/plug/POWER"),
        other => panic!("expected PUBACK timeout, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_lwt_snapshot_filters_requested_devices() {
    let (connector, broker) = FakeBroker::start();
    broker.retain("tele/plug/LWT", "Online");
    broker.retain("tele/other/LWT", "Offline");
    broker.retain("lamp/tele/LWT", "Offline");

    let snapshot = client(connector)
        .read_lwt_snapshot(&["plug".to_string(), "lamp".to_string()], Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.get("plug"), Some(&Presence::Online));
    assert_eq!(snapshot.get("lamp"), Some(&Presence::Offline));
    assert!(!snapshot.contains_key("other"));
}

#[tokio::test(start_paused = true)]
async fn test_lwt_snapshot_without_filter_collects_everything() {
    let (connector, broker) = FakeBroker::start();
    broker.retain("tele/plug/LWT", "Online");
    broker.retain("tele/other/LWT", "Offline");

    let snapshot = client(connector)
        .read_lwt_snapshot(&[], Duration::from_millis(600))
        .await
        .unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.get("other"), Some(&Presence::Offline));
}

#[tokio::test(start_paused = true)]
async fn test_scan_reports_devices_seen_in_window() {
    let (connector, broker) = FakeBroker::start();
    broker.retain("tele/strip/LWT", "Online");
    broker.retain("tele/strip/STATE", r#"{"POWER1":"ON","POWER2":"OFF"}"#);
    broker.retain("stat/plug/RESULT", r#"{"POWER":"ON"}"#);
    broker.retain("homeassistant/status", "online");

    let devices = client(connector)
        .scan_devices(Duration::from_secs(3))
        .await
        .unwrap();

    let ids: Vec<&str> = devices.iter().map(|d| d.device_id.as_str()).collect();
    assert_eq!(ids, vec!["plug", "strip"]);
    assert_eq!(devices[0].power, ObservedPower::On);
    assert_eq!(devices[0].online, None);
    assert_eq!(devices[1].online, Some(true));
    assert_eq!(devices[1].available_command_channels, vec!["POWER1", "POWER2"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_command_names_topic_and_cause() {
    let (connector, broker) = FakeBroker::start();
    broker.reject_with(5);

    let envelope = CommandEnvelope::new("plug", CommandAction::Off, "req-9");
    let err = client(connector).publish_command(&envelope).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Failed to publish MQTT command (cmnd/plug/POWER: MQTT CONNACK rejected with code 5)"
    );
}
