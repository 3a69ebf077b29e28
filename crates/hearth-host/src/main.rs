// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hearth Host - multiplayer instance control plane
//!
//! An HTTP/WebSocket server responsible for:
//! - Instance lifecycle (provision, boot, restart, shut down)
//! - Worker supervision (one sandboxed subprocess per instance)
//! - Player relay (fan-out between player sockets and the worker)
//! - Idle reaping

use std::sync::Arc;
use tracing::{info, warn};

use hearth_host::auth::JwtVerifier;
use hearth_host::config::Config;
use hearth_host::provision::{GitProvisioner, GitProvisionerConfig};
use hearth_host::reaper::ReaperConfig;
use hearth_host::runtime::HostRuntime;
use hearth_host::supervisor::{ProcessLauncher, ProcessLauncherConfig, WorkerLauncher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearth_host=info,worker=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        public_host = %config.public_host,
        data_dir = %config.data_dir.display(),
        "Starting Hearth Host"
    );

    let provisioner = Arc::new(GitProvisioner::new(GitProvisionerConfig {
        remote_base: config.world_remote.clone(),
        build_command: config.world_build_command.clone(),
        entrypoint: config.worker_entrypoint.clone(),
    }));

    let launcher = Arc::new(ProcessLauncher::new(ProcessLauncherConfig {
        program: config.worker_program.clone(),
        ..ProcessLauncherConfig::default()
    }));
    info!(launcher_type = launcher.launcher_type(), "Launcher initialized");

    let verifier = Arc::new(JwtVerifier::new(config.session_secret.as_bytes()));

    let runtime = HostRuntime::builder()
        .bind_addr(config.http_addr)
        .public_host(&config.public_host)
        .data_dir(&config.data_dir)
        .provisioner(provisioner)
        .launcher(launcher)
        .verifier(verifier)
        .reaper(ReaperConfig {
            poll_interval: config.reaper_interval,
            idle_not_started: config.idle_not_started,
            idle_no_players: config.idle_no_players,
        })
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Host ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Hearth Host shut down");

    Ok(())
}
