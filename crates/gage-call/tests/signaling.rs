mod common;

use common::*;
use gage_call::signaling::message::{JoinGroupPayload, MessageType};
use gage_call::signaling::{
    ChannelStatus, CloseReason, ConnectionKey, ConnectionManager, ConnectionStatus, Frame,
    SignalingHandle, spawn_channel,
};
use gage_common::config::{HealthConfig, SignalingConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn channel(connector: Arc<MemoryConnector>) -> SignalingHandle {
    init_tracing();
    let (handle, _task) = spawn_channel(
        ConnectionKey::new(GROUP, "alice"),
        SignalingConfig::default(),
        HealthConfig::default(),
        connector,
    );
    handle
}

async fn wait_status<F>(handle: &SignalingHandle, predicate: F) -> ChannelStatus
where
    F: FnMut(&ChannelStatus) -> bool,
{
    let mut rx = handle.watch_status();
    tokio::time::timeout(Duration::from_secs(600), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for channel status")
        .expect("channel stopped")
        .clone()
}

async fn open(
    handle: &SignalingHandle,
    accepted: &mut mpsc::UnboundedReceiver<ServerSide>,
) -> ServerSide {
    handle.connect().await;
    let mut server = accepted.recv().await.expect("socket accepted");
    let join = server.expect(MessageType::JoinCallGroup).await;
    let payload: JoinGroupPayload = join.payload_as().unwrap();
    assert_eq!(payload.group_id, GROUP);
    assert_eq!(payload.username, "alice");
    server
}

#[tokio::test(start_paused = true)]
async fn test_send_before_open_returns_false() {
    let (connector, _accepted) = MemoryConnector::new(ConnectBehavior::Accept);
    let handle = channel(connector);
    assert!(!handle.send(MessageType::CallStarted, json!({})).await);
}

#[tokio::test(start_paused = true)]
async fn test_normal_close_does_not_reconnect() {
    let (connector, mut accepted) = MemoryConnector::new(ConnectBehavior::Accept);
    let handle = channel(connector.clone());
    let server = open(&handle, &mut accepted).await;

    server.close(1000, "").await;
    let status = wait_status(&handle, |s| s.status == ConnectionStatus::Disconnected).await;
    assert_eq!(status.attempts, 0);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(handle.status().health.instability_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_close_schedules_reconnect() {
    let (connector, mut accepted) = MemoryConnector::new(ConnectBehavior::Accept);
    let handle = channel(connector.clone());
    let server = open(&handle, &mut accepted).await;

    // Dropping the server end without a close frame reads as 1006.
    drop(server);
    let status = wait_status(&handle, |s| s.attempts == 1).await;
    assert_eq!(status.health.instability_count, 1);

    let mut server = accepted.recv().await.expect("reconnected");
    server.expect(MessageType::JoinCallGroup).await;
    let status = wait_status(&handle, |s| s.status == ConnectionStatus::Connected).await;
    assert_eq!(status.attempts, 0);
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_peer_close_with_clean_reason_does_not_reconnect() {
    let (connector, mut accepted) = MemoryConnector::new(ConnectBehavior::Accept);
    let handle = channel(connector.clone());
    let server = open(&handle, &mut accepted).await;

    server.close(4000, "connection_timeout").await;
    wait_status(&handle, |s| s.status == ConnectionStatus::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_reconnect_attempts() {
    let (connector, _accepted) = MemoryConnector::new(ConnectBehavior::Refuse);
    let handle = channel(connector.clone());
    handle.connect().await;

    let status = wait_status(&handle, |s| s.status == ConnectionStatus::Failed).await;
    assert_eq!(status.attempts, 10);
    // The first attempt plus ten reconnects.
    assert_eq!(connector.attempts(), 11);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 11);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_delays_stay_within_cap() {
    let (connector, _accepted) = MemoryConnector::new(ConnectBehavior::Refuse);
    let handle = channel(connector.clone());
    let started = tokio::time::Instant::now();
    handle.connect().await;

    let mut status_rx = handle.watch_status();
    let mut last = started;
    let mut seen = 1;
    while seen < 11 {
        status_rx.changed().await.unwrap();
        let attempts = connector.attempts();
        if attempts > seen {
            let now = tokio::time::Instant::now();
            assert!(now - last <= Duration::from_millis(45_000), "gap {:?}", now - last);
            last = now;
            seen = attempts;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_reports_timeout_and_retries() {
    let (connector, mut accepted) = MemoryConnector::new(ConnectBehavior::Accept);
    connector.script(&[ConnectBehavior::Hang]);
    let handle = channel(connector.clone());
    handle.connect().await;

    let status = wait_status(&handle, |s| s.status == ConnectionStatus::Timeout).await;
    assert_eq!(status.attempts, 1);

    let mut server = accepted.recv().await.expect("second attempt accepted");
    server.expect(MessageType::JoinCallGroup).await;
    wait_status(&handle, |s| s.status == ConnectionStatus::Connected).await;
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_external_connect_is_debounced() {
    let (connector, mut accepted) = MemoryConnector::new(ConnectBehavior::Accept);
    let handle = channel(connector.clone());
    let server = open(&handle, &mut accepted).await;

    // Already open: no-op.
    handle.connect().await;
    server.close(1000, "").await;
    wait_status(&handle, |s| s.status == ConnectionStatus::Disconnected).await;

    // Within five seconds of the previous attempt.
    handle.connect().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(connector.attempts(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.connect().await;
    accepted.recv().await.expect("debounce window passed");
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_closes_cleanly_and_is_idempotent() {
    let (connector, mut accepted) = MemoryConnector::new(ConnectBehavior::Accept);
    let handle = channel(connector.clone());
    let mut server = open(&handle, &mut accepted).await;

    handle.teardown(CloseReason::Manual).await;
    assert_eq!(
        server.next_frame().await,
        Frame::Close {
            code: 1000,
            reason: "manual_disconnect".into()
        }
    );
    handle.teardown(CloseReason::Manual).await;
    assert!(handle.is_closed());
    assert_eq!(handle.status().status, ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_pings_every_thirty_seconds() {
    let (connector, mut accepted) = MemoryConnector::new(ConnectBehavior::Accept);
    let handle = channel(connector);
    let mut server = open(&handle, &mut accepted).await;
    let opened = tokio::time::Instant::now();

    match server.next_frame().await {
        Frame::Text(text) => assert!(text.contains("\"PING\"")),
        other => panic!("expected ping, got {other:?}"),
    }
    assert!(opened.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_malformed_messages_are_dropped() {
    let (connector, mut accepted) = MemoryConnector::new(ConnectBehavior::Accept);
    let handle = channel(connector);
    let mut events = handle.subscribe();
    let server = open(&handle, &mut accepted).await;

    server.inject_raw("not json").await;
    server
        .inject_raw(r#"{"type":"TYPING","sender":"bob","groupId":"calibration-lab","payload":{}}"#)
        .await;
    server
        .inject(&remote(MessageType::CallStarted, "bob", json!({ "callKind": "audio" })))
        .await;

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, MessageType::CallStarted);
    assert_eq!(event.sender, "bob");
}

#[tokio::test(start_paused = true)]
async fn test_outgoing_envelope_carries_identity() {
    let (connector, mut accepted) = MemoryConnector::new(ConnectBehavior::Accept);
    let handle = channel(connector);
    let mut server = open(&handle, &mut accepted).await;

    assert!(handle.send(MessageType::CallEnded, json!({})).await);
    let sent = server.expect(MessageType::CallEnded).await;
    assert_eq!(sent.sender, "alice");
    assert_eq!(sent.group_id, GROUP);
    assert_eq!(sent.instance_id, handle.instance_id());
}

#[tokio::test(start_paused = true)]
async fn test_manager_keeps_one_connection_per_key() {
    let (connector, mut accepted) = MemoryConnector::new(ConnectBehavior::Accept);
    let manager = ConnectionManager::new(
        connector.clone(),
        SignalingConfig::default(),
        HealthConfig::default(),
    );
    let key = ConnectionKey::new(GROUP, "alice");

    let (a, b) = tokio::join!(manager.open(key.clone()), manager.open(key.clone()));
    assert_eq!(a.instance_id(), b.instance_id());
    accepted.recv().await.expect("one socket");
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(manager.active_count().await, 1);

    let other = manager.open(ConnectionKey::new(GROUP, "bob")).await;
    assert_ne!(other.instance_id(), a.instance_id());
    assert_eq!(manager.active_count().await, 2);

    manager.close(&key, CloseReason::Teardown).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(a.is_closed());
    assert_eq!(manager.active_count().await, 1);
    assert!(manager.get(&key).await.is_none());

    // A fresh channel can take the slot afterwards.
    let reopened = manager.open(key.clone()).await;
    assert_ne!(reopened.instance_id(), a.instance_id());
}

#[tokio::test(start_paused = true)]
async fn test_manager_forgets_channels_that_stop_on_their_own() {
    let (connector, _accepted) = MemoryConnector::new(ConnectBehavior::Accept);
    let manager = ConnectionManager::new(
        connector,
        SignalingConfig::default(),
        HealthConfig::default(),
    );
    let key = ConnectionKey::new(GROUP, "alice");
    let handle = manager.open(key.clone()).await;

    handle.teardown(CloseReason::Cleanup).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(manager.get(&key).await.is_none());
}
