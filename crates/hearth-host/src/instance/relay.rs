// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pump from a worker's message bus into the instance.

use std::sync::Arc;

use hearth_protocol::{ControlMessage, LogLevel};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::Instance;
use crate::supervisor::{Subscription, WorkerProcess};

/// Handle every message from `worker` until its bus closes.
pub(super) async fn run(
    instance: Arc<Instance>,
    worker: Arc<WorkerProcess>,
    mut subscription: Subscription,
) {
    while let Some(message) = subscription.recv().await {
        handle(&instance, &worker, &message).await;
    }
    debug!(instance_id = %instance.id(), "Worker message bus closed");
    instance.worker_lost(&worker).await;
}

async fn handle(instance: &Instance, worker: &Arc<WorkerProcess>, message: &ControlMessage) {
    let outgoing = matches!(
        message,
        ControlMessage::OutgoingPacket { .. } | ControlMessage::MultiOutgoingPackets { .. }
    );
    // Players only hear from the attached worker: not a replaced one draining
    // its queue, nor a new one that has not reported up yet.
    if outgoing && !instance.connections().is_attached(worker).await {
        debug!(
            instance_id = %instance.id(),
            op = %message.kind(),
            "Dropping packet from worker that is not the relay target"
        );
        return;
    }

    match message {
        ControlMessage::OutgoingPacket {
            connection_id,
            packet,
        } => {
            instance
                .connections()
                .deliver(connection_id.as_deref(), packet)
                .await;
        }
        ControlMessage::MultiOutgoingPackets { packets } => {
            instance.connections().deliver_batch(packets).await;
        }
        ControlMessage::SetStatus { status } => {
            instance.record_status(worker, status.clone()).await;
        }
        ControlMessage::LogMessage {
            level,
            message,
            detail,
        } => forward_log(instance.id(), *level, message, detail.as_ref()),
        ControlMessage::GetKvValueRequest { request_id, key } => {
            let scope = &instance.info().world.world_id;
            let value = match instance.kv().get(scope, key).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(instance_id = %instance.id(), key = %key, error = %e, "KV lookup failed");
                    None
                }
            };
            worker
                .send(&ControlMessage::GetKvValueResponse {
                    request_id: request_id.clone(),
                    key: key.clone(),
                    value,
                })
                .await;
        }
        ControlMessage::SetKvValue { key, value } => {
            let scope = &instance.info().world.world_id;
            if let Err(e) = instance.kv().set(scope, key, value.clone()).await {
                warn!(instance_id = %instance.id(), key = %key, error = %e, "KV write failed");
            }
        }
        ControlMessage::DeleteKvValue { key } => {
            let scope = &instance.info().world.world_id;
            if let Err(e) = instance.kv().delete(scope, key).await {
                warn!(instance_id = %instance.id(), key = %key, error = %e, "KV delete failed");
            }
        }
        ControlMessage::Heartbeat { .. } => instance.record_heartbeat(worker).await,
        ControlMessage::WorkerUp => {
            debug!(instance_id = %instance.id(), "Worker reported up");
        }
        ControlMessage::ConnectionEstablished { .. }
        | ControlMessage::ConnectionDropped { .. }
        | ControlMessage::IncomingPacket { .. }
        | ControlMessage::GetKvValueResponse { .. } => {
            warn!(
                instance_id = %instance.id(),
                op = %message.kind(),
                "Ignoring host-to-worker op sent by worker"
            );
        }
    }
}

fn forward_log(instance_id: &str, level: LogLevel, message: &str, detail: Option<&Value>) {
    let detail = detail.map(Value::to_string).unwrap_or_default();
    match level {
        LogLevel::Debug => debug!(target: "worker", instance_id = %instance_id, detail = %detail, "{}", message),
        LogLevel::Info => info!(target: "worker", instance_id = %instance_id, detail = %detail, "{}", message),
        LogLevel::Warn => warn!(target: "worker", instance_id = %instance_id, detail = %detail, "{}", message),
        LogLevel::Error => error!(target: "worker", instance_id = %instance_id, detail = %detail, "{}", message),
    }
}
