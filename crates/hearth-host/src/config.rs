// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for hearth-host.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Host configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket listen address
    pub http_addr: SocketAddr,
    /// host:port workers use to connect back to this host
    pub public_host: String,
    /// HMAC secret for player session tokens
    pub session_secret: String,
    /// Root for world working trees and worker temp dirs
    pub data_dir: PathBuf,
    /// Git remote base; worlds are cloned from `{world_remote}/{world_id}.git`
    pub world_remote: String,
    /// Optional shell command run inside the world dir after fetching
    pub world_build_command: Option<String>,
    /// Worker executable
    pub worker_program: String,
    /// Worker entrypoint, relative to the world dir
    pub worker_entrypoint: PathBuf,
    /// How often the reaper scans the registry
    pub reaper_interval: Duration,
    /// Idle time after which a non-started instance is reaped
    pub idle_not_started: Duration,
    /// Idle time after which an instance without players is reaped
    pub idle_no_players: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("HEARTH_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let public_host = std::env::var("HEARTH_PUBLIC_HOST")
            .unwrap_or_else(|_| format!("127.0.0.1:{}", port));

        let session_secret = std::env::var("HEARTH_SESSION_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("HEARTH_SESSION_SECRET"))?;

        let data_dir =
            PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let world_remote = std::env::var("HEARTH_WORLD_REMOTE")
            .unwrap_or_else(|_| "https://git.invalid/worlds".to_string());

        let world_build_command = std::env::var("HEARTH_WORLD_BUILD_CMD")
            .ok()
            .filter(|cmd| !cmd.trim().is_empty());

        let worker_program =
            std::env::var("HEARTH_WORKER_PROGRAM").unwrap_or_else(|_| "deno".to_string());

        let worker_entrypoint = PathBuf::from(
            std::env::var("HEARTH_WORKER_ENTRYPOINT")
                .unwrap_or_else(|_| "worker/main.ts".to_string()),
        );

        Ok(Self {
            http_addr,
            public_host,
            session_secret,
            data_dir,
            world_remote,
            world_build_command,
            worker_program,
            worker_entrypoint,
            reaper_interval: nonzero(
                "HEARTH_REAPER_INTERVAL_SECS",
                secs_from_env("HEARTH_REAPER_INTERVAL_SECS", 60)?,
            )?,
            idle_not_started: secs_from_env("HEARTH_IDLE_NOT_STARTED_SECS", 600)?,
            idle_no_players: secs_from_env("HEARTH_IDLE_NO_PLAYERS_SECS", 300)?,
        })
    }
}

fn secs_from_env(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse_secs(var, &raw),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn nonzero(var: &'static str, duration: Duration) -> Result<Duration, ConfigError> {
    if duration.is_zero() {
        return Err(ConfigError::ZeroDuration(var));
    }
    Ok(duration)
}

fn parse_secs(var: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::InvalidNumber(var))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// A numeric variable did not parse.
    #[error("Invalid number in environment variable: {0}")]
    InvalidNumber(&'static str),
    /// A duration that must be positive was zero.
    #[error("Environment variable {0} must be greater than zero")]
    ZeroDuration(&'static str),
}
