// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Player ⇄ worker relay tests.

mod common;

use std::sync::Arc;

use common::*;
use hearth_host::kv::KvStore;
use hearth_host::transport::ChannelTransport;
use serde_json::{Value, json};

fn parse(text: &str) -> Value {
    serde_json::from_str(text).unwrap()
}

#[tokio::test]
async fn test_broadcast_skips_broken_socket() {
    let host = TestHost::new();
    let instance = host.started().await;
    let worker = instance.worker().await.unwrap();

    let (_, mut a) = connect(&instance, "a").await;
    let (broken, broken_rx) = ChannelTransport::new();
    drop(broken_rx);
    instance
        .register_connection(Arc::new(broken), player("broken"))
        .await
        .unwrap();
    let (_, mut c) = connect(&instance, "c").await;

    worker
        .handle_message(
            r#"{"op":"OutgoingPacket","connectionId":null,"packet":{"type":"Chat","message":"hello all"}}"#,
        )
        .await;

    for rx in [&mut a, &mut c] {
        let packet = parse(&next_text(rx).await);
        assert_eq!(packet["type"], "Chat");
        assert_eq!(packet["message"], "hello all");
    }
}

#[tokio::test]
async fn test_batch_preserves_order_per_destination() {
    let host = TestHost::new();
    let instance = host.started().await;
    let worker = instance.worker().await.unwrap();
    let (id_a, mut a) = connect(&instance, "a").await;
    let (id_b, mut b) = connect(&instance, "b").await;

    let batch = json!({
        "op": "MultiOutgoingPackets",
        "packets": [
            [id_a, {"type": "EntitySpawn", "entityId": "e1"}],
            [id_a, {"type": "TransformChange", "entityId": "e1", "position": [1.0, 2.0, 3.0], "rotation": [0.0, 0.0, 0.0, 1.0]}],
            [id_b, {"type": "EntityDestroy", "entityId": "e9"}],
        ]
    });
    worker.handle_message(&batch.to_string()).await;

    assert_eq!(parse(&next_text(&mut a).await)["type"], "EntitySpawn");
    assert_eq!(parse(&next_text(&mut a).await)["type"], "TransformChange");
    assert_eq!(parse(&next_text(&mut b).await)["type"], "EntityDestroy");
    assert!(stays_quiet(&mut b).await);
}

#[tokio::test]
async fn test_unicast_to_departed_player_is_skipped() {
    let host = TestHost::new();
    let instance = host.started().await;
    let worker = instance.worker().await.unwrap();
    let (_, mut a) = connect(&instance, "a").await;

    worker
        .handle_message(
            r#"{"op":"OutgoingPacket","connectionId":"ghost","packet":{"type":"EntityDestroy","entityId":"e1"}}"#,
        )
        .await;
    worker
        .handle_message(
            r#"{"op":"OutgoingPacket","connectionId":null,"packet":{"type":"EntityDestroy","entityId":"e2"}}"#,
        )
        .await;

    assert_eq!(parse(&next_text(&mut a).await)["entityId"], "e2");
}

#[tokio::test]
async fn test_inbound_packets_are_validated_and_stamped() {
    let host = TestHost::new();
    let instance = host.started().await;
    let mut worker_rx = host.launcher.take_worker_rx(instance.id());
    let (connection_id, _rx) = connect(&instance, "a").await;

    let established = parse(&next_text(&mut worker_rx).await);
    assert_eq!(established["op"], "ConnectionEstablished");
    assert_eq!(established["connectionId"], connection_id.as_str());
    assert_eq!(established["playerId"], "a");
    assert_eq!(established["nickname"], "a-nick");

    // Missing tag, unknown tag, not an object: dropped, connection kept.
    for bad in [
        r#"{"message":"no tag"}"#,
        r#"{"type":"Teleport","to":[0,0,0]}"#,
        r#"[1,2,3]"#,
        "not json",
    ] {
        assert!(!instance.handle_client_message(&connection_id, bad).await);
    }
    assert!(instance.connections().contains(&connection_id).await);
    assert!(stays_quiet(&mut worker_rx).await);

    // A client cannot spoof another sender.
    let spoofed = r#"{"type":"Chat","origin":"someone-else","message":"hi"}"#;
    assert!(instance.handle_client_message(&connection_id, spoofed).await);

    let incoming = parse(&next_text(&mut worker_rx).await);
    assert_eq!(incoming["op"], "IncomingPacket");
    assert_eq!(incoming["connectionId"], connection_id.as_str());
    assert_eq!(incoming["packet"]["origin"], connection_id.as_str());
    assert_eq!(incoming["packet"]["message"], "hi");
}

#[tokio::test]
async fn test_disconnect_notifies_worker() {
    let host = TestHost::new();
    let instance = host.started().await;
    let mut worker_rx = host.launcher.take_worker_rx(instance.id());
    let (connection_id, _rx) = connect(&instance, "a").await;
    next_text(&mut worker_rx).await;

    instance.connection_closed(&connection_id).await;

    let dropped = parse(&next_text(&mut worker_rx).await);
    assert_eq!(dropped["op"], "ConnectionDropped");
    assert_eq!(dropped["connectionId"], connection_id.as_str());
    assert!(!instance.connections().contains(&connection_id).await);
}

#[tokio::test]
async fn test_invalid_worker_message_is_dropped() {
    let host = TestHost::new();
    let instance = host.started().await;
    let worker = instance.worker().await.unwrap();
    let (_, mut a) = connect(&instance, "a").await;

    assert!(!worker.handle_message(r#"{"op":"Explode"}"#).await);
    assert!(
        !worker
            .handle_message(r#"{"op":"OutgoingPacket","connectionId":null,"packet":{"type":"Nope"}}"#)
            .await
    );
    assert!(stays_quiet(&mut a).await);

    // The bus keeps working afterwards.
    worker
        .handle_message(
            r#"{"op":"OutgoingPacket","connectionId":null,"packet":{"type":"Chat","message":"still here"}}"#,
        )
        .await;
    assert_eq!(parse(&next_text(&mut a).await)["message"], "still here");
}

#[tokio::test]
async fn test_kv_requests_are_bridged() {
    let host = TestHost::new();
    let instance = host.started().await;
    let worker = instance.worker().await.unwrap();
    let mut worker_rx = host.launcher.take_worker_rx(instance.id());

    worker
        .handle_message(r#"{"op":"SetKvValue","key":"score","value":{"best":42}}"#)
        .await;
    worker
        .handle_message(r#"{"op":"GetKvValueRequest","requestId":"r1","key":"score"}"#)
        .await;

    let response = parse(&next_text(&mut worker_rx).await);
    assert_eq!(response["op"], "GetKvValueResponse");
    assert_eq!(response["requestId"], "r1");
    assert_eq!(response["value"], json!({"best": 42}));

    // Values are scoped by world.
    assert_eq!(
        host.kv.get("meadow", "score").await.unwrap(),
        Some(json!({"best": 42}))
    );

    worker
        .handle_message(r#"{"op":"DeleteKvValue","key":"score"}"#)
        .await;
    worker
        .handle_message(r#"{"op":"GetKvValueRequest","requestId":"r2","key":"score"}"#)
        .await;
    let response = parse(&next_text(&mut worker_rx).await);
    assert_eq!(response["requestId"], "r2");
    assert_eq!(response["value"], Value::Null);
}

#[tokio::test]
async fn test_status_and_heartbeat_are_recorded() {
    let host = TestHost::new();
    let instance = host.started().await;
    let worker = instance.worker().await.unwrap();

    worker
        .handle_message(r#"{"op":"SetStatus","status":{"players":[{"id":"a"},{"id":"b"}]}}"#)
        .await;
    worker
        .handle_message(r#"{"op":"Heartbeat","timestamp_ms":1700000000000}"#)
        .await;

    assert!(eventually(|| async { instance.reported_players().await == Some(2) }).await);
    assert!(eventually(|| async { instance.snapshot().await.last_heartbeat.is_some() }).await);
    let snapshot = instance.snapshot().await;
    assert_eq!(snapshot.worker_status.unwrap()["players"][1]["id"], "b");
}

#[tokio::test]
async fn test_players_joining_during_restart_reach_new_worker() {
    let host = TestHost::new();
    let instance = host.started().await;

    let restart = instance.restart().await;
    let (connection_id, _rx) = connect(&instance, "late").await;
    restart.wait().await.unwrap();

    let mut worker_rx = host.launcher.take_worker_rx(instance.id());
    let established = parse(&next_text(&mut worker_rx).await);
    assert_eq!(established["op"], "ConnectionEstablished");
    assert_eq!(established["connectionId"], connection_id.as_str());
    assert!(stays_quiet(&mut worker_rx).await);
}

#[tokio::test]
async fn test_only_attached_worker_reaches_players() {
    let host = TestHost::new();
    let instance = host.started().await;
    let old_worker = instance.worker().await.unwrap();
    let (_, mut a) = connect(&instance, "a").await;

    host.launcher.set_mode(LaunchMode::Silent);
    let restart = instance.restart().await;
    assert!(
        eventually(|| async {
            instance
                .worker()
                .await
                .is_some_and(|w| !Arc::ptr_eq(&w, &old_worker))
        })
        .await
    );
    let new_worker = instance.worker().await.unwrap();
    let broadcast =
        r#"{"op":"OutgoingPacket","connectionId":null,"packet":{"type":"Chat","message":"early"}}"#;

    // Output from a worker that has not reported up is dropped.
    assert!(new_worker.handle_message(broadcast).await);
    assert!(stays_quiet(&mut a).await);

    new_worker.handle_message(r#"{"op":"WorkerUp"}"#).await;
    restart.wait().await.unwrap();
    new_worker
        .handle_message(
            r#"{"op":"OutgoingPacket","connectionId":null,"packet":{"type":"Chat","message":"live"}}"#,
        )
        .await;
    assert_eq!(parse(&next_text(&mut a).await)["message"], "live");
}
