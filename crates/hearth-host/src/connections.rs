// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Player connection relay for one instance.
//!
//! Maps "one worker, many players" onto "one player, one socket". Inbound
//! player frames are schema-checked, stamped with their origin and forwarded
//! to the current worker as `IncomingPacket`. Outbound packets from the worker
//! go to one connection or to all of them.
//!
//! Connections outlive workers: on restart the worker is detached and a new
//! one attached later, which is told about every connection still present.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hearth_protocol::{AppPacket, ConnectionId, ControlMessage};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::supervisor::WorkerProcess;
use crate::transport::Transport;

/// Who is on the other end of a player socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerIdentity {
    /// Authenticated player id.
    pub player_id: String,
    /// Display name.
    pub nickname: Option<String>,
    /// Chosen character.
    pub character_id: Option<String>,
}

/// One registered player socket.
#[derive(Debug, Clone)]
pub struct PlayerConnection {
    /// Host-assigned id.
    pub id: ConnectionId,
    /// Player behind the socket.
    pub identity: PlayerIdentity,
    /// Outbound handle.
    pub transport: Arc<dyn Transport>,
    /// When the handshake completed.
    pub connected_at: DateTime<Utc>,
}

impl PlayerConnection {
    fn established(&self) -> ControlMessage {
        ControlMessage::ConnectionEstablished {
            connection_id: self.id.clone(),
            player_id: self.identity.player_id.clone(),
            character_id: self.identity.character_id.clone(),
            nickname: self.identity.nickname.clone(),
        }
    }
}

/// All live player sockets of one instance.
pub struct ConnectionManager {
    instance_id: String,
    connections: Mutex<HashMap<ConnectionId, PlayerConnection>>,
    worker: RwLock<Option<Arc<WorkerProcess>>>,
}

impl ConnectionManager {
    /// Create an empty manager with no worker attached.
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            connections: Mutex::new(HashMap::new()),
            worker: RwLock::new(None),
        }
    }

    /// Store a new connection and announce it to the worker, if any.
    pub async fn register_connection(
        &self,
        transport: Arc<dyn Transport>,
        identity: PlayerIdentity,
    ) -> ConnectionId {
        let connection = PlayerConnection {
            id: uuid::Uuid::new_v4().to_string(),
            identity,
            transport,
            connected_at: Utc::now(),
        };
        let id = connection.id.clone();
        let announce = connection.established();

        // The worker is read under the connections lock so that a concurrent
        // attach_worker either sees this connection or is seen by it.
        let mut connections = self.connections.lock().await;
        connections.insert(id.clone(), connection);
        info!(instance_id = %self.instance_id, connection_id = %id, "Player connected");

        if let Some(worker) = self.worker().await {
            worker.send(&announce).await;
        }
        drop(connections);
        id
    }

    /// Handle one text frame from connection `connection_id`.
    ///
    /// Returns whether the frame was forwarded. Invalid frames are dropped and
    /// the connection stays open.
    pub async fn handle_inbound(&self, connection_id: &str, text: &str) -> bool {
        if !self.contains(connection_id).await {
            debug!(instance_id = %self.instance_id, connection_id = %connection_id, "Frame from unknown connection");
            return false;
        }

        let mut packet = match AppPacket::from_json(text) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(
                    instance_id = %self.instance_id,
                    connection_id = %connection_id,
                    error = %e,
                    "Dropping invalid packet from player"
                );
                return false;
            }
        };
        packet.stamp_origin(connection_id);

        let Some(worker) = self.worker().await else {
            debug!(instance_id = %self.instance_id, "No worker attached; dropping player packet");
            return false;
        };
        worker
            .send(&ControlMessage::IncomingPacket {
                connection_id: connection_id.to_string(),
                packet,
            })
            .await
    }

    /// Remove a connection after its socket closed, telling the worker.
    pub async fn unregister(&self, connection_id: &str) -> bool {
        let mut connections = self.connections.lock().await;
        if connections.remove(connection_id).is_none() {
            return false;
        }
        info!(instance_id = %self.instance_id, connection_id = %connection_id, "Player disconnected");

        if let Some(worker) = self.worker().await {
            worker
                .send(&ControlMessage::ConnectionDropped {
                    connection_id: connection_id.to_string(),
                })
                .await;
        }
        true
    }

    /// Deliver `packet` to `destination`, or to everyone when `None`.
    ///
    /// Returns the number of transports that accepted it. A missing target is
    /// skipped; a failing transport is logged and does not stop the others.
    pub async fn deliver(&self, destination: Option<&str>, packet: &AppPacket) -> usize {
        let Some(text) = self.encode(packet) else {
            return 0;
        };
        let connections = self.connections.lock().await;
        self.send_locked(&connections, destination, text)
    }

    /// Deliver a batch of `(destination, packet)` pairs in order.
    pub async fn deliver_batch(&self, packets: &[(Option<ConnectionId>, AppPacket)]) -> usize {
        let connections = self.connections.lock().await;
        packets
            .iter()
            .filter_map(|(destination, packet)| {
                self.encode(packet).map(|text| (destination.as_deref(), text))
            })
            .map(|(destination, text)| self.send_locked(&connections, destination, text))
            .sum()
    }

    fn encode(&self, packet: &AppPacket) -> Option<String> {
        match packet.to_json() {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(instance_id = %self.instance_id, error = %e, "Failed to encode packet");
                None
            }
        }
    }

    fn send_locked(
        &self,
        connections: &HashMap<ConnectionId, PlayerConnection>,
        destination: Option<&str>,
        text: String,
    ) -> usize {
        match destination {
            Some(id) => match connections.get(id) {
                Some(connection) => usize::from(self.send_one(connection, text)),
                None => {
                    debug!(instance_id = %self.instance_id, connection_id = %id, "Target gone; skipping packet");
                    0
                }
            },
            None => connections
                .values()
                .filter(|connection| self.send_one(connection, text.clone()))
                .count(),
        }
    }

    fn send_one(&self, connection: &PlayerConnection, text: String) -> bool {
        match connection.transport.send(text) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    instance_id = %self.instance_id,
                    connection_id = %connection.id,
                    error = %e,
                    "Failed to send to player"
                );
                false
            }
        }
    }

    /// Make `worker` the relay target and announce every current connection to it.
    pub async fn attach_worker(&self, worker: Arc<WorkerProcess>) {
        let connections = self.connections.lock().await;
        for connection in connections.values() {
            worker.send(&connection.established()).await;
        }
        *self.worker.write().await = Some(worker);
        debug!(
            instance_id = %self.instance_id,
            connections = connections.len(),
            "Worker attached to relay"
        );
    }

    /// Stop relaying to the current worker.
    pub async fn detach_worker(&self) -> Option<Arc<WorkerProcess>> {
        self.worker.write().await.take()
    }

    /// Stop relaying to `worker` if it is still the relay target.
    pub async fn detach_worker_if(&self, worker: &Arc<WorkerProcess>) -> bool {
        let mut slot = self.worker.write().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, worker)) {
            *slot = None;
            return true;
        }
        false
    }

    /// Current relay target.
    pub async fn worker(&self) -> Option<Arc<WorkerProcess>> {
        self.worker.read().await.clone()
    }

    /// Whether `worker` is the current relay target.
    pub async fn is_attached(&self, worker: &Arc<WorkerProcess>) -> bool {
        self.worker
            .read()
            .await
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, worker))
    }

    /// Close and forget every connection.
    pub async fn close_all(&self, code: u16, reason: &str) -> usize {
        let drained: Vec<PlayerConnection> =
            self.connections.lock().await.drain().map(|(_, c)| c).collect();
        for connection in &drained {
            connection.transport.close(code, reason);
        }
        if !drained.is_empty() {
            info!(
                instance_id = %self.instance_id,
                count = drained.len(),
                reason = reason,
                "Closed player connections"
            );
        }
        drained.len()
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Whether there are no live connections.
    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Whether `connection_id` is live.
    pub async fn contains(&self, connection_id: &str) -> bool {
        self.connections.lock().await.contains_key(connection_id)
    }

    /// Ids of every live connection.
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.lock().await.keys().cloned().collect()
    }
}
