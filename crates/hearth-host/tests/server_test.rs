// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route-level tests: auth ordering on the socket routes and the operator API.

mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use common::*;
use hearth_host::auth::{JwtVerifier, SessionClaims};
use hearth_host::server::{AppState, router};
use serde_json::{Value, json};
use tower::ServiceExt;

const SECRET: &[u8] = b"server-test-secret";

fn app(host: &TestHost) -> Router {
    router(AppState {
        registry: host.registry.clone(),
        pool: host.pool.clone(),
        verifier: Arc::new(JwtVerifier::new(SECRET)),
    })
}

fn token_for(instance_id: &str, secret: &[u8]) -> String {
    let exp = (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as u64;
    JwtVerifier::new(secret)
        .issue(&SessionClaims {
            instance_id: instance_id.to_string(),
            world_id: "meadow".to_string(),
            player_id: "p1".to_string(),
            nickname: None,
            character_id: None,
            exp,
        })
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let host = TestHost::new();
    host.started().await;
    let (status, body) = send(app(&host), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "instances": 1, "workers": 1}));
}

#[tokio::test]
async fn test_player_connect_auth_failures() {
    let host = TestHost::new();
    let instance = host.create(Default::default());
    let id = instance.id().to_string();

    let (status, body) = send(app(&host), get(&format!("/instances/{id}/connect"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("missing token"));

    let forged = token_for(&id, b"some-other-secret");
    let (status, _) = send(
        app(&host),
        get(&format!("/instances/{id}/connect?token={forged}")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let elsewhere = token_for("another-instance", SECRET);
    let (status, _) = send(
        app(&host),
        get(&format!("/instances/{id}/connect?token={elsewhere}")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let missing = token_for("gone", SECRET);
    let (status, body) = send(app(&host), get(&format!("/instances/gone/connect?token={missing}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("gone"));
}

#[tokio::test]
async fn test_player_connect_valid_token_needs_upgrade() {
    let host = TestHost::new();
    let instance = host.create(Default::default());
    let id = instance.id().to_string();
    let token = token_for(&id, SECRET);

    let (status, _) = send(app(&host), get(&format!("/instances/{id}/connect?token={token}"))).await;

    // Authorized, so the only complaint left is the missing WebSocket handshake.
    assert!(status.is_client_error());
    assert_ne!(status, StatusCode::UNAUTHORIZED);
    assert_ne!(status, StatusCode::FORBIDDEN);
    assert_ne!(status, StatusCode::NOT_FOUND);
    assert_eq!(host.launcher.launches(), 0);
}

#[tokio::test]
async fn test_worker_callback_requires_capability_token() {
    let host = TestHost::new();
    host.started().await;

    let (status, _) = send(app(&host), get("/internal/worker")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/internal/worker")
        .header(header::AUTHORIZATION, "Bearer not-a-real-token")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app(&host), request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_instance_crud() {
    let host = TestHost::new();

    let create = Request::builder()
        .method("POST")
        .uri("/instances")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "world": {"worldId": "meadow", "variant": "main"},
                "flags": {"closeOnEmpty": true},
                "startedBy": "operator"
            })
            .to_string(),
        ))
        .unwrap();
    let (status, body) = send(app(&host), create).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_str().unwrap().to_string();
    assert_eq!(body["flags"]["closeOnEmpty"], true);
    assert_eq!(body["startedBy"], "operator");

    let instance = host.registry.get(&id).unwrap();
    instance.await_booted().await.unwrap();

    let (status, body) = send(app(&host), get(&format!("/instances/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "started");

    let (status, body) = send(app(&host), get("/instances")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let restart = Request::builder()
        .method("POST")
        .uri(format!("/instances/{id}/restart"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app(&host), restart).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    instance.await_booted().await.unwrap();
    assert_eq!(host.launcher.launches(), 2);

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/instances/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app(&host), delete).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(app(&host), get(&format!("/instances/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_create_rejects_empty_world() {
    let host = TestHost::new();
    let create = Request::builder()
        .method("POST")
        .uri("/instances")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"world": {"worldId": " ", "variant": "main"}}).to_string(),
        ))
        .unwrap();
    let (status, _) = send(app(&host), create).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(host.registry.is_empty());
}

#[tokio::test]
async fn test_unknown_instance_routes() {
    let host = TestHost::new();
    let restart = Request::builder()
        .method("POST")
        .uri("/instances/nope/restart")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app(&host), restart).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let delete = Request::builder()
        .method("DELETE")
        .uri("/instances/nope")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app(&host), delete).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
