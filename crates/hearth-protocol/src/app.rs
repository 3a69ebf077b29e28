// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application packets exchanged between players and the worker.
//!
//! The host validates these against the schema below but never interprets
//! entity payloads; `data`, `value`, `inputs` and `bodies` are opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConnectionId, ProtocolError, decode_tagged};

/// Application-level packet, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum AppPacket {
    /// Chat line. `origin` is stamped by the host.
    Chat {
        /// Sender connection id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<ConnectionId>,
        /// Message text.
        message: String,
    },

    /// Player avatar motion. `origin` is stamped by the host.
    PlayerMotion {
        /// Sender connection id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<ConnectionId>,
        /// World-space position.
        position: [f64; 3],
        /// World-space velocity.
        #[serde(default)]
        velocity: [f64; 3],
        /// Facing as a quaternion.
        #[serde(default = "identity_rotation")]
        rotation: [f64; 4],
    },

    /// Raw input state for the player's character. `origin` is stamped by the host.
    PlayerInputs {
        /// Sender connection id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<ConnectionId>,
        /// Opaque input map.
        inputs: Value,
    },

    /// An entity came into existence.
    EntitySpawn {
        /// Entity id.
        entity_id: String,
        /// Opaque replicated component values.
        #[serde(default)]
        data: Value,
    },

    /// An entity was removed.
    EntityDestroy {
        /// Entity id.
        entity_id: String,
    },

    /// An entity moved.
    TransformChange {
        /// Entity id.
        entity_id: String,
        /// New position.
        position: [f64; 3],
        /// New rotation quaternion.
        #[serde(default = "identity_rotation")]
        rotation: [f64; 4],
    },

    /// One replicated value on an entity changed.
    ValueChange {
        /// Entity id.
        entity_id: String,
        /// Component/value key.
        key: String,
        /// Opaque new value.
        value: Value,
    },

    /// Periodic physics state.
    PhysicsSnapshot {
        /// Simulation tick.
        tick: u64,
        /// Opaque body states.
        bodies: Value,
    },
}

fn identity_rotation() -> [f64; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

impl AppPacket {
    /// Every `type` tag this build understands.
    pub const TAGS: &'static [&'static str] = &[
        "Chat",
        "PlayerMotion",
        "PlayerInputs",
        "EntitySpawn",
        "EntityDestroy",
        "TransformChange",
        "ValueChange",
        "PhysicsSnapshot",
    ];

    /// Decode and schema-validate one packet.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode_tagged(text, "type", Self::TAGS)
    }

    /// Encode for a player socket.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The `type` tag of this packet.
    pub fn tag(&self) -> &'static str {
        match self {
            AppPacket::Chat { .. } => "Chat",
            AppPacket::PlayerMotion { .. } => "PlayerMotion",
            AppPacket::PlayerInputs { .. } => "PlayerInputs",
            AppPacket::EntitySpawn { .. } => "EntitySpawn",
            AppPacket::EntityDestroy { .. } => "EntityDestroy",
            AppPacket::TransformChange { .. } => "TransformChange",
            AppPacket::ValueChange { .. } => "ValueChange",
            AppPacket::PhysicsSnapshot { .. } => "PhysicsSnapshot",
        }
    }

    /// Overwrite the sender on relay-with-origin packets.
    ///
    /// Whatever origin the client claimed is discarded. Returns `true` if the
    /// packet carries an origin at all.
    pub fn stamp_origin(&mut self, connection_id: &str) -> bool {
        match self {
            AppPacket::Chat { origin, .. }
            | AppPacket::PlayerMotion { origin, .. }
            | AppPacket::PlayerInputs { origin, .. } => {
                *origin = Some(connection_id.to_string());
                true
            }
            AppPacket::EntitySpawn { .. }
            | AppPacket::EntityDestroy { .. }
            | AppPacket::TransformChange { .. }
            | AppPacket::ValueChange { .. }
            | AppPacket::PhysicsSnapshot { .. } => false,
        }
    }

    /// Sender stamped on this packet, if any.
    pub fn origin(&self) -> Option<&str> {
        match self {
            AppPacket::Chat { origin, .. }
            | AppPacket::PlayerMotion { origin, .. }
            | AppPacket::PlayerInputs { origin, .. } => origin.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_chat() {
        let packet = AppPacket::from_json(r#"{"type":"Chat","message":"hi"}"#).unwrap();
        assert_eq!(
            packet,
            AppPacket::Chat {
                origin: None,
                message: "hi".to_string()
            }
        );
    }

    #[test]
    fn test_missing_tag_rejected() {
        let err = AppPacket::from_json(r#"{"message":"hi"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingTag("type")));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = AppPacket::from_json(r#"{"type":"Teleport","to":[0,0,0]}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(ref t) if t == "Teleport"));
    }

    #[test]
    fn test_wrong_field_type_rejected() {
        let err = AppPacket::from_json(r#"{"type":"PhysicsSnapshot","tick":"soon","bodies":[]}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(matches!(
            AppPacket::from_json("[1,2,3]").unwrap_err(),
            ProtocolError::NotAnObject
        ));
        assert!(matches!(
            AppPacket::from_json("not json").unwrap_err(),
            ProtocolError::Malformed(_)
        ));
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let packet = AppPacket::from_json(
            r#"{"type":"EntityDestroy","entityId":"e1","reason":"despawned"}"#,
        )
        .unwrap();
        assert_eq!(
            packet,
            AppPacket::EntityDestroy {
                entity_id: "e1".to_string()
            }
        );
    }

    #[test]
    fn test_stamp_origin_overrides_client_claim() {
        let mut packet =
            AppPacket::from_json(r#"{"type":"Chat","origin":"someone-else","message":"spoof"}"#)
                .unwrap();
        assert!(packet.stamp_origin("c42"));
        assert_eq!(packet.origin(), Some("c42"));
    }

    #[test]
    fn test_stamp_origin_skips_entity_packets() {
        let mut packet = AppPacket::EntityDestroy {
            entity_id: "e1".to_string(),
        };
        assert!(!packet.stamp_origin("c1"));
        assert_eq!(packet.origin(), None);
    }

    #[test]
    fn test_motion_defaults() {
        let packet =
            AppPacket::from_json(r#"{"type":"PlayerMotion","position":[1.0,2.0,3.0]}"#).unwrap();
        match packet {
            AppPacket::PlayerMotion {
                velocity, rotation, ..
            } => {
                assert_eq!(velocity, [0.0, 0.0, 0.0]);
                assert_eq!(rotation, [0.0, 0.0, 0.0, 1.0]);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_camel_case_fields_on_wire() {
        let packet = AppPacket::ValueChange {
            entity_id: "e7".to_string(),
            key: "hp".to_string(),
            value: json!(12),
        };
        let value: Value = serde_json::from_str(&packet.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "ValueChange");
        assert_eq!(value["entityId"], "e7");
    }

    #[test]
    fn test_tags_cover_every_variant() {
        let samples = [
            AppPacket::Chat {
                origin: None,
                message: String::new(),
            },
            AppPacket::PlayerInputs {
                origin: None,
                inputs: json!({}),
            },
            AppPacket::PhysicsSnapshot {
                tick: 1,
                bodies: json!([]),
            },
        ];
        for packet in samples {
            assert!(AppPacket::TAGS.contains(&packet.tag()));
        }
    }
}
