//! Client registration, broadcast and teardown

mod common;

use std::time::Duration;

use common::{connect, connect_flaky, drain, drain_events, test_manager};
use eventcast_core::{
    EventSink, ManagerConfig, ManagerError, ManagerEvent, SinkState, SseManager, TransportError,
    CONNECTED_PAYLOAD,
};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

async fn wait_for_count(manager: &SseManager, expected: usize) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while manager.client_count() != expected {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("client count should settle");
}

#[tokio::test]
async fn test_connect_then_broadcast() {
    let manager = test_manager();
    let mut events = manager.subscribe();
    let (id, mut stream) = connect(&manager).await;

    let head = stream.head();
    assert_eq!(head.status, 200);
    assert_eq!(head.header("Cache-Control"), Some("no-cache"));
    assert_eq!(head.header("X-Accel-Buffering"), Some("no"));

    let payload = json!({ "type": "test", "content": "Hello World" });
    let result = manager.broadcast(&payload).await;
    assert_eq!(result.successful, 1);
    assert!(result.all_succeeded());

    let frames = drain(&mut stream);
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].comments, vec![String::new()]);
    assert_eq!(frames[1].data.as_deref(), Some(CONNECTED_PAYLOAD));

    let broadcast = &frames[2];
    assert!(broadcast.id.is_none());
    assert!(broadcast.event.is_none());
    let received: Value = serde_json::from_str(broadcast.data.as_deref().unwrap()).unwrap();
    assert_eq!(received, payload);

    let connected = drain_events(&mut events);
    assert!(matches!(
        &connected[..],
        [ManagerEvent::ClientConnected { client_id }] if *client_id == id
    ));
}

#[tokio::test]
async fn test_closing_one_client_leaves_others() {
    let manager = test_manager();
    let (a, stream_a) = connect(&manager).await;
    let (b, mut stream_b) = connect(&manager).await;
    drain(&mut stream_b);

    // Peer hangs up: the close listener unregisters it
    drop(stream_a);
    wait_for_count(&manager, 1).await;
    assert_eq!(manager.client_ids(), vec![b.clone()]);
    assert!(!manager.disconnect_client(&a).await);

    let result = manager.broadcast("still here").await;
    assert_eq!(result.successful, 1);
    assert_eq!(result.failed, 0);
    assert_eq!(drain(&mut stream_b).len(), 1);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let manager = test_manager();
    let (id, stream) = connect(&manager).await;
    let mut events = manager.subscribe();

    assert!(manager.disconnect_client(&id).await);
    assert!(!manager.disconnect_client(&id).await);
    assert_eq!(manager.client_count(), 0);
    assert_eq!(stream.state(), SinkState::Closed);

    let disconnects = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ManagerEvent::ClientDisconnected { .. }))
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn test_destroy_client() {
    let manager = test_manager();
    let (id, mut stream) = connect(&manager).await;
    drain(&mut stream);

    manager.destroy_client(&id).await;
    assert_eq!(manager.client_count(), 0);
    assert_eq!(stream.state(), SinkState::Destroyed);
    assert!(matches!(
        stream.next().await,
        Some(Err(TransportError::Destroyed))
    ));

    // Unknown ids are a no-op
    manager.destroy_client(&id).await;
}

#[tokio::test]
async fn test_transport_destroyed_externally() {
    let manager = test_manager();
    let (_id, sink, _stream) = connect_flaky(&manager).await;

    sink.destroy();
    wait_for_count(&manager, 0).await;
}

#[tokio::test]
async fn test_capacity_exceeded() {
    let manager = SseManager::new(ManagerConfig::for_testing().with_max_clients(2));
    let (_a, _sa) = connect(&manager).await;
    let (_b, _sb) = connect(&manager).await;

    let (sink, _stream) = eventcast_core::ChannelSink::pair(8);
    let result = manager
        .add_client(
            &eventcast_core::ConnectionRequest::new(),
            std::sync::Arc::new(sink),
        )
        .await;
    assert!(matches!(
        result,
        Err(ManagerError::CapacityExceeded { limit: 2 })
    ));
    assert_eq!(manager.client_count(), 2);
}

#[tokio::test]
async fn test_activity_and_headers_for_unknown_client() {
    let manager = test_manager();
    let unknown = eventcast_core::ClientId::from("client-nope");
    assert!(!manager.record_client_activity(&unknown, 10).await);
    assert!(!manager.set_custom_header(&unknown, "x-a", "b").await);
    assert!(manager.client_snapshot(&unknown).await.is_none());
}

#[tokio::test]
async fn test_broadcast_counts_failures() {
    let manager = test_manager();
    let (_ok, mut ok_stream) = connect(&manager).await;
    let (bad, sink, _bad_stream) = connect_flaky(&manager).await;
    drain(&mut ok_stream);

    sink.set_failing(true);
    let result = manager.broadcast(&json!({ "n": 1 })).await;

    assert_eq!(result.successful, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.failed_ids, vec![bad.clone()]);
    // broadcasts are never queued
    let snapshot = manager.client_snapshot(&bad).await.unwrap();
    assert_eq!(snapshot.queue_len, 0);
}
