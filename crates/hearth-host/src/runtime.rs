// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for hearth-host.
//!
//! [`HostRuntime`] wires the registry, worker pool, HTTP server and reaper
//! together so the host can run inside an existing tokio application (or a
//! test) instead of only as the `hearth-host` binary.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hearth_host::auth::JwtVerifier;
//! use hearth_host::runtime::HostRuntime;
//!
//! let runtime = HostRuntime::builder()
//!     .provisioner(Arc::new(provisioner))
//!     .launcher(Arc::new(launcher))
//!     .verifier(Arc::new(JwtVerifier::new(b"secret")))
//!     .bind_addr("127.0.0.1:0".parse()?)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ... players connect to runtime.local_addr() ...
//!
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::auth::AuthVerifier;
use crate::instance::{HostServices, HostSettings};
use crate::kv::{KvStore, MemoryKvStore};
use crate::provision::WorldProvisioner;
use crate::reaper::{Reaper, ReaperConfig};
use crate::registry::InstanceRegistry;
use crate::server::{AppState, run_server};
use crate::supervisor::{WorkerLauncher, WorkerPool};

/// Builder for creating a [`HostRuntime`].
pub struct HostRuntimeBuilder {
    bind_addr: SocketAddr,
    public_host: Option<String>,
    data_dir: PathBuf,
    provisioner: Option<Arc<dyn WorldProvisioner>>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    verifier: Option<Arc<dyn AuthVerifier>>,
    kv: Option<Arc<dyn KvStore>>,
    pool: Option<Arc<WorkerPool>>,
    reaper: ReaperConfig,
}

impl Default for HostRuntimeBuilder {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_host: None,
            data_dir: PathBuf::from(".data"),
            provisioner: None,
            launcher: None,
            verifier: None,
            kv: None,
            pool: None,
            reaper: ReaperConfig::default(),
        }
    }
}

impl HostRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the HTTP bind address.
    ///
    /// Default: `0.0.0.0:8080`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the host:port workers use to call back.
    ///
    /// Default: `127.0.0.1:{bound port}`
    pub fn public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = Some(host.into());
        self
    }

    /// Set the data directory for world trees and worker temp dirs.
    ///
    /// Default: `.data`
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Set the world provisioner (required).
    pub fn provisioner(mut self, provisioner: Arc<dyn WorldProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Set the worker launcher (required).
    pub fn launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Set the session token verifier (required).
    pub fn verifier(mut self, verifier: Arc<dyn AuthVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Set the worker KV backend.
    ///
    /// Default: in-memory
    pub fn kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Share an existing worker pool, e.g. with a launcher that looks workers up.
    ///
    /// Default: a fresh pool
    pub fn pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the reaper configuration.
    pub fn reaper(mut self, config: ReaperConfig) -> Self {
        self.reaper = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<HostRuntimeConfig> {
        let provisioner = self
            .provisioner
            .ok_or_else(|| anyhow::anyhow!("provisioner is required"))?;
        let launcher = self
            .launcher
            .ok_or_else(|| anyhow::anyhow!("launcher is required"))?;
        let verifier = self
            .verifier
            .ok_or_else(|| anyhow::anyhow!("verifier is required"))?;

        Ok(HostRuntimeConfig {
            bind_addr: self.bind_addr,
            public_host: self.public_host,
            data_dir: self.data_dir,
            provisioner,
            launcher,
            verifier,
            kv: self
                .kv
                .unwrap_or_else(|| Arc::new(MemoryKvStore::new()) as Arc<dyn KvStore>),
            pool: self.pool.unwrap_or_default(),
            reaper: self.reaper,
        })
    }
}

/// Configuration for a [`HostRuntime`].
pub struct HostRuntimeConfig {
    bind_addr: SocketAddr,
    public_host: Option<String>,
    data_dir: PathBuf,
    provisioner: Arc<dyn WorldProvisioner>,
    launcher: Arc<dyn WorkerLauncher>,
    verifier: Arc<dyn AuthVerifier>,
    kv: Arc<dyn KvStore>,
    pool: Arc<WorkerPool>,
    reaper: ReaperConfig,
}

impl HostRuntimeConfig {
    /// Bind the listener and spawn the server and reaper tasks.
    pub async fn start(self) -> Result<HostRuntime> {
        tokio::fs::create_dir_all(self.data_dir.join("worlds")).await?;
        tokio::fs::create_dir_all(self.data_dir.join("tmp")).await?;

        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let connect_host = self
            .public_host
            .unwrap_or_else(|| format!("127.0.0.1:{}", local_addr.port()));
        let connect_url = format!("ws://{connect_host}/internal/worker");

        let pool = self.pool;
        let services = Arc::new(HostServices {
            provisioner: self.provisioner,
            launcher: self.launcher,
            pool: pool.clone(),
            kv: self.kv,
            settings: HostSettings {
                data_dir: self.data_dir.clone(),
                connect_url: connect_url.clone(),
                connect_host,
            },
        });
        let registry = Arc::new(InstanceRegistry::new(services));

        // Reaper
        let reaper = Reaper::new(registry.clone(), self.reaper);
        let reaper_shutdown = reaper.shutdown_handle();
        let reaper_handle = tokio::spawn(async move {
            reaper.run().await;
        });

        // HTTP server
        let state = AppState {
            registry: registry.clone(),
            pool: pool.clone(),
            verifier: self.verifier,
        };
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(run_server(listener, state, server_shutdown_rx));

        info!(
            addr = %local_addr,
            connect_url = %connect_url,
            data_dir = %self.data_dir.display(),
            "HostRuntime started"
        );

        Ok(HostRuntime {
            server_handle,
            reaper_handle,
            server_shutdown_tx,
            reaper_shutdown,
            registry,
            pool,
            local_addr,
        })
    }
}

/// A running host.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct HostRuntime {
    server_handle: JoinHandle<Result<()>>,
    reaper_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    reaper_shutdown: Arc<Notify>,
    registry: Arc<InstanceRegistry>,
    pool: Arc<WorkerPool>,
    local_addr: SocketAddr,
}

impl HostRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> HostRuntimeBuilder {
        HostRuntimeBuilder::new()
    }

    /// Address the HTTP server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Instance registry.
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Worker pool.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Shut every instance down, then stop the reaper and the server.
    pub async fn shutdown(self) -> Result<()> {
        info!("HostRuntime shutting down...");

        self.registry.shutdown_all().await;

        self.reaper_shutdown.notify_one();
        let _ = self.server_shutdown_tx.send(true);

        if let Err(e) = self.reaper_handle.await {
            error!("Reaper task panicked: {}", e);
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("HostRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("HTTP server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("HTTP server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && !self.reaper_handle.is_finished()
    }
}
