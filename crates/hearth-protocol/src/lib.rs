// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hearth Protocol - JSON message types shared by host, worker and clients
//!
//! Two independent protocols travel over WebSocket text frames, one JSON
//! object per frame:
//!
//! ```text
//! ┌──────────┐  AppPacket (type=...)   ┌──────────┐  ControlMessage (op=...)  ┌──────────┐
//! │  Client  │ ◄─────────────────────► │   Host   │ ◄───────────────────────► │  Worker  │
//! └──────────┘                         └──────────┘                           └──────────┘
//! ```
//!
//! ## Application protocol ([`AppPacket`], tag `type`)
//!
//! Chat, player motion and inputs, entity spawn/destroy, transform and value
//! changes, physics snapshots. The host stamps the sender's connection id on
//! packets that carry an `origin` and otherwise relays them untouched.
//!
//! ## Control protocol ([`ControlMessage`], tag `op`)
//!
//! | Op | Direction | Description |
//! |----|-----------|-------------|
//! | `ConnectionEstablished` | host → worker | A player joined |
//! | `ConnectionDropped` | host → worker | A player left |
//! | `IncomingPacket` | host → worker | Application packet from a player |
//! | `OutgoingPacket` | worker → host | Application packet to one player or everyone |
//! | `MultiOutgoingPackets` | worker → host | Batch of the above, order preserved |
//! | `SetStatus` | worker → host | Opaque status report (player list) |
//! | `LogMessage` | worker → host | Structured log line |
//! | `GetKvValueRequest` / `SetKvValue` / `DeleteKvValue` | worker → host | KV access |
//! | `GetKvValueResponse` | host → worker | KV lookup result |
//! | `Heartbeat` | worker → host | Liveness ping |
//! | `WorkerUp` | worker → host | Worker finished booting |
//!
//! # Version skew
//!
//! Decoding fails closed: a message whose tag is missing or unknown is
//! reported as a [`ProtocolError`] and the caller drops it. Unknown *fields*
//! on a known tag are ignored, so either side may add optional fields without
//! breaking the other.

mod app;
mod control;
mod error;

pub use app::AppPacket;
pub use control::{ControlMessage, LogLevel, OpKind, reported_player_count};
pub use error::ProtocolError;

/// Connection identifier assigned by the host to each player socket.
pub type ConnectionId = String;

/// Decode a JSON object carrying a string discriminant in `tag_field`.
///
/// The tag is checked against `known` before the typed decode so callers can
/// tell "newer peer" apart from "garbage".
pub(crate) fn decode_tagged<T: serde::de::DeserializeOwned>(
    text: &str,
    tag_field: &'static str,
    known: &[&str],
) -> Result<T, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let Some(object) = value.as_object() else {
        return Err(ProtocolError::NotAnObject);
    };
    let tag = match object.get(tag_field) {
        Some(serde_json::Value::String(tag)) => tag,
        Some(_) | None => return Err(ProtocolError::MissingTag(tag_field)),
    };
    if !known.contains(&tag.as_str()) {
        return Err(ProtocolError::UnknownTag(tag.clone()));
    }
    Ok(serde_json::from_value(value)?)
}
