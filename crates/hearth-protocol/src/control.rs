// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host ↔ worker control messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppPacket, ConnectionId, ProtocolError, decode_tagged};

/// Worker log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug detail.
    Debug,
    /// Informational.
    Info,
    /// Something looks wrong.
    Warn,
    /// Something failed.
    Error,
}

/// Control-protocol message, discriminated by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// A player socket was registered with the host.
    ConnectionEstablished {
        /// Host-assigned connection id.
        connection_id: ConnectionId,
        /// Authenticated player id.
        player_id: String,
        /// Character the player chose, if any.
        #[serde(default)]
        character_id: Option<String>,
        /// Display name, if any.
        #[serde(default)]
        nickname: Option<String>,
    },

    /// A player socket closed.
    ConnectionDropped {
        /// Host-assigned connection id.
        connection_id: ConnectionId,
    },

    /// Application packet received from a player.
    IncomingPacket {
        /// Sender connection id.
        connection_id: ConnectionId,
        /// The validated packet.
        packet: AppPacket,
    },

    /// Application packet to deliver; `null` destination means broadcast.
    OutgoingPacket {
        /// Destination connection id, or `None` for every player.
        connection_id: Option<ConnectionId>,
        /// The packet to deliver.
        packet: AppPacket,
    },

    /// Batch of `[destination, packet]` pairs, delivered in order.
    MultiOutgoingPackets {
        /// Destination/packet pairs.
        packets: Vec<(Option<ConnectionId>, AppPacket)>,
    },

    /// Opaque status report from the worker.
    SetStatus {
        /// Status payload; see [`reported_player_count`].
        status: Value,
    },

    /// Structured log line from the worker.
    LogMessage {
        /// Severity.
        level: LogLevel,
        /// Human-readable message.
        message: String,
        /// Optional structured detail.
        #[serde(default)]
        detail: Option<Value>,
    },

    /// Worker asks for a KV value.
    GetKvValueRequest {
        /// Correlates the response.
        request_id: String,
        /// Key to look up.
        key: String,
    },

    /// Host answers a KV lookup.
    GetKvValueResponse {
        /// Echo of the request id.
        request_id: String,
        /// Key that was looked up.
        key: String,
        /// Stored value, `None` if absent.
        value: Option<Value>,
    },

    /// Worker stores a KV value.
    SetKvValue {
        /// Key to write.
        key: String,
        /// Value to store.
        value: Value,
    },

    /// Worker deletes a KV value.
    DeleteKvValue {
        /// Key to delete.
        key: String,
    },

    /// Liveness ping.
    Heartbeat {
        /// Worker wall clock in milliseconds since the epoch.
        #[serde(rename = "timestamp_ms")]
        timestamp_ms: u64,
    },

    /// Worker finished booting and is ready for players.
    WorkerUp,
}

/// Field-less discriminant of [`ControlMessage`], used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// See [`ControlMessage::ConnectionEstablished`].
    ConnectionEstablished,
    /// See [`ControlMessage::ConnectionDropped`].
    ConnectionDropped,
    /// See [`ControlMessage::IncomingPacket`].
    IncomingPacket,
    /// See [`ControlMessage::OutgoingPacket`].
    OutgoingPacket,
    /// See [`ControlMessage::MultiOutgoingPackets`].
    MultiOutgoingPackets,
    /// See [`ControlMessage::SetStatus`].
    SetStatus,
    /// See [`ControlMessage::LogMessage`].
    LogMessage,
    /// See [`ControlMessage::GetKvValueRequest`].
    GetKvValueRequest,
    /// See [`ControlMessage::GetKvValueResponse`].
    GetKvValueResponse,
    /// See [`ControlMessage::SetKvValue`].
    SetKvValue,
    /// See [`ControlMessage::DeleteKvValue`].
    DeleteKvValue,
    /// See [`ControlMessage::Heartbeat`].
    Heartbeat,
    /// See [`ControlMessage::WorkerUp`].
    WorkerUp,
}

impl OpKind {
    /// Wire name of the op.
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::ConnectionEstablished => "ConnectionEstablished",
            OpKind::ConnectionDropped => "ConnectionDropped",
            OpKind::IncomingPacket => "IncomingPacket",
            OpKind::OutgoingPacket => "OutgoingPacket",
            OpKind::MultiOutgoingPackets => "MultiOutgoingPackets",
            OpKind::SetStatus => "SetStatus",
            OpKind::LogMessage => "LogMessage",
            OpKind::GetKvValueRequest => "GetKvValueRequest",
            OpKind::GetKvValueResponse => "GetKvValueResponse",
            OpKind::SetKvValue => "SetKvValue",
            OpKind::DeleteKvValue => "DeleteKvValue",
            OpKind::Heartbeat => "Heartbeat",
            OpKind::WorkerUp => "WorkerUp",
        }
    }

    /// Every op this build understands.
    pub const ALL: &'static [OpKind] = &[
        OpKind::ConnectionEstablished,
        OpKind::ConnectionDropped,
        OpKind::IncomingPacket,
        OpKind::OutgoingPacket,
        OpKind::MultiOutgoingPackets,
        OpKind::SetStatus,
        OpKind::LogMessage,
        OpKind::GetKvValueRequest,
        OpKind::GetKvValueResponse,
        OpKind::SetKvValue,
        OpKind::DeleteKvValue,
        OpKind::Heartbeat,
        OpKind::WorkerUp,
    ];
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const OP_TAGS: &[&str] = &[
    "ConnectionEstablished",
    "ConnectionDropped",
    "IncomingPacket",
    "OutgoingPacket",
    "MultiOutgoingPackets",
    "SetStatus",
    "LogMessage",
    "GetKvValueRequest",
    "GetKvValueResponse",
    "SetKvValue",
    "DeleteKvValue",
    "Heartbeat",
    "WorkerUp",
];

impl ControlMessage {
    /// Decode and schema-validate one control message.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode_tagged(text, "op", OP_TAGS)
    }

    /// Encode for the worker transport.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Discriminant of this message.
    pub fn kind(&self) -> OpKind {
        match self {
            ControlMessage::ConnectionEstablished { .. } => OpKind::ConnectionEstablished,
            ControlMessage::ConnectionDropped { .. } => OpKind::ConnectionDropped,
            ControlMessage::IncomingPacket { .. } => OpKind::IncomingPacket,
            ControlMessage::OutgoingPacket { .. } => OpKind::OutgoingPacket,
            ControlMessage::MultiOutgoingPackets { .. } => OpKind::MultiOutgoingPackets,
            ControlMessage::SetStatus { .. } => OpKind::SetStatus,
            ControlMessage::LogMessage { .. } => OpKind::LogMessage,
            ControlMessage::GetKvValueRequest { .. } => OpKind::GetKvValueRequest,
            ControlMessage::GetKvValueResponse { .. } => OpKind::GetKvValueResponse,
            ControlMessage::SetKvValue { .. } => OpKind::SetKvValue,
            ControlMessage::DeleteKvValue { .. } => OpKind::DeleteKvValue,
            ControlMessage::Heartbeat { .. } => OpKind::Heartbeat,
            ControlMessage::WorkerUp => OpKind::WorkerUp,
        }
    }
}

/// Number of players the worker reports in a `SetStatus` payload.
///
/// Accepts either a `players` array or a numeric `playerCount`. Returns `None`
/// when the status carries neither.
pub fn reported_player_count(status: &Value) -> Option<usize> {
    if let Some(players) = status.get("players").and_then(Value::as_array) {
        return Some(players.len());
    }
    status
        .get("playerCount")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
}
