// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP/WebSocket server.
//!
//! Two socket routes carry the relay: players connect to
//! `/instances/{id}/connect` with a session token, workers call back on
//! `/internal/worker` with their capability token. Operator routes live in
//! [`crate::handlers`].

use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    extract::{
        Path, Query, State,
        rejection::QueryRejection,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, AuthVerifier, SessionClaims};
use crate::connections::PlayerIdentity;
use crate::error::{ConnectError, Error};
use crate::handlers;
use crate::instance::Instance;
use crate::registry::InstanceRegistry;
use crate::supervisor::{WorkerPool, WorkerProcess};
use crate::transport::{CLOSE_TRY_AGAIN, ChannelTransport, Outbound, Transport};

/// Shared state of every route.
#[derive(Clone)]
pub struct AppState {
    /// Instances
    pub registry: Arc<InstanceRegistry>,
    /// Capability token lookup
    pub pool: Arc<WorkerPool>,
    /// Session token verification
    pub verifier: Arc<dyn AuthVerifier>,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/instances/{id}",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .route("/instances/{id}/restart", post(handlers::restart_instance))
        .route("/instances/{id}/connect", get(connect_player))
        .route("/internal/worker", get(connect_worker))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` flips to `true`.
pub async fn run_server(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "HTTP server starting");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    token: Option<String>,
}

/// Verify a player's token and resolve the instance it grants access to.
pub fn authorize_player(
    registry: &InstanceRegistry,
    verifier: &dyn AuthVerifier,
    instance_id: &str,
    token: Option<&str>,
) -> Result<(Arc<Instance>, SessionClaims), ConnectError> {
    let token = token.ok_or_else(|| ConnectError::Unauthorized("missing token".to_string()))?;
    let claims = verifier
        .verify(token)
        .map_err(|e| ConnectError::Unauthorized(e.to_string()))?;
    if claims.instance_id != instance_id {
        return Err(ConnectError::InstanceMismatch);
    }
    let instance = registry
        .get(instance_id)
        .ok_or_else(|| ConnectError::NoSuchInstance(instance_id.to_string()))?;
    Ok((instance, claims))
}

async fn connect_player(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    query: Result<Query<ConnectQuery>, QueryRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, Error> {
    let token = query.ok().and_then(|Query(q)| q.token);
    let (instance, claims) = authorize_player(
        &state.registry,
        state.verifier.as_ref(),
        &instance_id,
        token.as_deref(),
    )?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(ws.on_upgrade(move |socket| player_session(socket, instance, claims)))
}

async fn player_session(socket: WebSocket, instance: Arc<Instance>, claims: SessionClaims) {
    let (mut sink, mut stream) = socket.split();

    if let Err(e) = instance.ensure_running().await {
        warn!(
            instance_id = %instance.id(),
            player_id = %claims.player_id,
            error = %e,
            "Refusing player; instance not running"
        );
        let _ = sink.send(close_message(CLOSE_TRY_AGAIN, &e.to_string())).await;
        return;
    }

    let (transport, outbound) = ChannelTransport::new();
    tokio::spawn(write_outbound(sink, outbound));

    let identity = PlayerIdentity {
        player_id: claims.player_id,
        nickname: claims.nickname,
        character_id: claims.character_id,
    };
    let connection_id = match instance
        .register_connection(Arc::new(transport.clone()), identity)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!(instance_id = %instance.id(), error = %e, "Refusing player; instance went away");
            transport.close(CLOSE_TRY_AGAIN, &e.to_string());
            return;
        }
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                instance
                    .handle_client_message(&connection_id, text.as_str())
                    .await;
            }
            Ok(Message::Binary(_)) => {
                debug!(connection_id = %connection_id, "Ignoring binary frame from player");
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "Player socket error");
                break;
            }
        }
    }

    instance.connection_closed(&connection_id).await;
}

/// Extract the token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

async fn connect_worker(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, Error> {
    let token = bearer_token(&headers)
        .ok_or_else(|| AuthError::Invalid("missing bearer token".to_string()))?;
    let worker = state
        .pool
        .get(token)
        .ok_or_else(|| AuthError::Invalid("unknown capability token".to_string()))?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(ws.on_upgrade(move |socket| worker_session(socket, worker)))
}

async fn worker_session(socket: WebSocket, worker: Arc<WorkerProcess>) {
    let (sink, mut stream) = socket.split();
    let (transport, outbound) = ChannelTransport::new();
    tokio::spawn(write_outbound(sink, outbound));

    let transport_id = match worker.accept_transport(Arc::new(transport)).await {
        Ok(id) => id,
        Err(e) => {
            warn!(instance_id = %worker.instance_id(), error = %e, "Rejected worker transport");
            return;
        }
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                worker.handle_message(text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                debug!(instance_id = %worker.instance_id(), "Ignoring binary frame from worker");
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                debug!(instance_id = %worker.instance_id(), error = %e, "Worker socket error");
                break;
            }
        }
    }

    worker.transport_closed(transport_id).await;
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Text(text) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink.send(close_message(code, &reason)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}
