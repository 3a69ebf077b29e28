// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hearth-host.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Host errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A wire message could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] hearth_protocol::ProtocolError),

    /// Session token verification failed.
    #[error("Auth error: {0}")]
    Auth(#[from] crate::auth::AuthError),

    /// Fetching or building a world failed.
    #[error("Provision error: {0}")]
    Provision(#[from] crate::provision::ProvisionError),

    /// Worker process supervision failed.
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] crate::supervisor::SupervisorError),

    /// KV backend failed.
    #[error("KV error: {0}")]
    Kv(#[from] crate::kv::KvError),

    /// A player could not be connected.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Instance was not found.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// User-visible reasons a player connection is refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// No instance with this id is registered.
    #[error("no such instance: {0}")]
    NoSuchInstance(String),

    /// The instance failed to boot (or its boot was superseded).
    #[error("failed to start: {0}")]
    FailedToStart(String),

    /// The session token was rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The token was issued for a different instance.
    #[error("token does not grant access to this instance")]
    InstanceMismatch,
}

/// Result type using host Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Connect(ConnectError::NoSuchInstance(_)) | Error::InstanceNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Error::Connect(ConnectError::Unauthorized(_)) | Error::Auth(_) => {
                StatusCode::UNAUTHORIZED
            }
            Error::Connect(ConnectError::InstanceMismatch) => StatusCode::FORBIDDEN,
            Error::Connect(ConnectError::FailedToStart(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Error::InvalidRequest(_) | Error::Protocol(_) | Error::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
