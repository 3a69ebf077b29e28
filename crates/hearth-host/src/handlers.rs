// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator routes: thin JSON handlers over the registry and orchestrator.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::{Value, json};
use tracing::info;

use crate::error::{Error, Result};
use crate::instance::{CreateInstance, InstanceSnapshot};
use crate::server::AppState;

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "instances": state.registry.len(),
        "workers": state.pool.len(),
    }))
}

/// `POST /instances`: create an instance and start booting it.
pub async fn create_instance(
    State(state): State<AppState>,
    Json(request): Json<CreateInstance>,
) -> Result<impl IntoResponse> {
    if request.world.world_id.trim().is_empty() {
        return Err(Error::InvalidRequest("world.worldId must not be empty".into()));
    }
    let instance = state.registry.create(request);
    // The boot runs in the background; callers poll the snapshot or connect.
    let _ = instance.boot(false).await;
    Ok((StatusCode::CREATED, Json(instance.snapshot().await)))
}

/// `GET /instances`
pub async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceSnapshot>> {
    let mut snapshots = Vec::new();
    for instance in state.registry.list() {
        snapshots.push(instance.snapshot().await);
    }
    snapshots.sort_by(|a, b| a.info.created_at.cmp(&b.info.created_at));
    Json(snapshots)
}

/// `GET /instances/{id}`
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceSnapshot>> {
    let instance = state
        .registry
        .get(&id)
        .ok_or(Error::InstanceNotFound(id))?;
    Ok(Json(instance.snapshot().await))
}

/// `POST /instances/{id}/restart`
pub async fn restart_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let instance = state
        .registry
        .get(&id)
        .ok_or(Error::InstanceNotFound(id))?;
    info!(instance_id = %instance.id(), "Restart requested by operator");
    let _ = instance.restart().await;
    Ok((StatusCode::ACCEPTED, Json(instance.snapshot().await)))
}

/// `DELETE /instances/{id}`: shut down and forget.
pub async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let instance = state
        .registry
        .remove(&id)
        .ok_or(Error::InstanceNotFound(id))?;
    info!(instance_id = %instance.id(), "Shutdown requested by operator");
    instance.shutdown().await;
    Ok(StatusCode::NO_CONTENT)
}
