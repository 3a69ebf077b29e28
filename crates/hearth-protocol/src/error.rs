// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protocol decode/encode errors.

use thiserror::Error;

/// Errors raised while decoding or encoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload is not valid JSON or does not match the schema for its tag.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The payload is valid JSON but not an object.
    #[error("message is not a JSON object")]
    NotAnObject,

    /// The discriminant field is absent or not a string.
    #[error("missing discriminant field `{0}`")]
    MissingTag(&'static str),

    /// The discriminant names a variant this build does not know.
    #[error("unknown message tag: {0}")]
    UnknownTag(String),
}
