// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance orchestrator: one game session's lifecycle.
//!
//! An [`Instance`] owns at most one [`WorkerProcess`] and exactly one
//! [`ConnectionManager`]. The worker is replaced wholesale on restart; the
//! connection manager, and with it every player socket, survives.
//!
//! Boots are coalesced. Every caller that needs the instance running during
//! one attempt waits on the same [`BootWaiter`]; a superseded attempt
//! (restart or shutdown mid-boot) rejects its waiters instead of leaving them
//! hanging.

mod relay;
mod status;

pub use status::InstanceStatus;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use hearth_protocol::{ConnectionId, reported_player_count};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use crate::connections::{ConnectionManager, PlayerIdentity};
use crate::error::ConnectError;
use crate::kv::KvStore;
use crate::provision::{WorldProvisioner, WorldRef};
use crate::supervisor::{
    OpFilter, WorkerConfig, WorkerExit, WorkerLauncher, WorkerPool, WorkerProcess,
};
use crate::transport::{CLOSE_GOING_AWAY, Transport};

/// Per-instance behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceFlags {
    /// Files are edited in place; local changes are never reverted from git.
    pub edit_mode: bool,
    /// Launch the worker in debug mode.
    pub debug_mode: bool,
    /// Shut down as soon as the last player leaves.
    pub close_on_empty: bool,
}

/// Request to create an instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstance {
    /// World to run.
    pub world: WorldRef,
    /// Behaviour switches.
    #[serde(default)]
    pub flags: InstanceFlags,
    /// Instance this one was derived from.
    #[serde(default)]
    pub origin_instance_id: Option<String>,
    /// World this one was derived from.
    #[serde(default)]
    pub origin_world_id: Option<String>,
    /// Who asked for it.
    #[serde(default)]
    pub started_by: Option<String>,
}

/// Immutable identity of an instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    /// Instance ID
    pub id: String,
    /// World being run
    pub world: WorldRef,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Behaviour switches
    pub flags: InstanceFlags,
    /// Session-derivation lineage
    pub origin_instance_id: Option<String>,
    /// Session-derivation lineage
    pub origin_world_id: Option<String>,
    /// Who started it
    pub started_by: Option<String>,
}

impl InstanceInfo {
    /// Build the identity for a freshly created instance.
    pub fn new(id: impl Into<String>, request: CreateInstance) -> Self {
        Self {
            id: id.into(),
            world: request.world,
            created_at: Utc::now(),
            flags: request.flags,
            origin_instance_id: request.origin_instance_id,
            origin_world_id: request.origin_world_id,
            started_by: request.started_by,
        }
    }
}

/// Host-level paths and URLs instances need to launch workers.
#[derive(Debug, Clone)]
pub struct HostSettings {
    /// Root for world trees (`worlds/{id}`) and worker temp dirs (`tmp/`).
    pub data_dir: PathBuf,
    /// WebSocket URL of the worker callback route.
    pub connect_url: String,
    /// host:port of the callback route.
    pub connect_host: String,
}

/// Collaborators shared by every instance.
#[derive(Clone)]
pub struct HostServices {
    /// Fetches and builds worlds.
    pub provisioner: Arc<dyn WorldProvisioner>,
    /// Spawns workers.
    pub launcher: Arc<dyn WorkerLauncher>,
    /// Capability token lookup.
    pub pool: Arc<WorkerPool>,
    /// Worker KV backend.
    pub kv: Arc<dyn KvStore>,
    /// Paths and URLs.
    pub settings: HostSettings,
}

/// Outcome of one boot attempt as observed by waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootProgress {
    /// Still running.
    Pending,
    /// Worker is up.
    Booted,
    /// Attempt failed or was superseded, with the reason.
    Failed(String),
}

/// Shared completion handle of a boot attempt.
pub struct BootWaiter {
    rx: watch::Receiver<BootProgress>,
}

impl BootWaiter {
    /// Wait for the attempt to finish.
    pub async fn wait(mut self) -> Result<(), ConnectError> {
        match self
            .rx
            .wait_for(|progress| *progress != BootProgress::Pending)
            .await
        {
            Ok(progress) => match &*progress {
                BootProgress::Booted => Ok(()),
                BootProgress::Failed(reason) => Err(ConnectError::FailedToStart(reason.clone())),
                BootProgress::Pending => Err(ConnectError::FailedToStart("boot abandoned".into())),
            },
            Err(_) => Err(ConnectError::FailedToStart("boot abandoned".into())),
        }
    }
}

struct BootAttempt {
    generation: u64,
    progress: watch::Sender<BootProgress>,
}

impl BootAttempt {
    fn is_pending(&self) -> bool {
        *self.progress.borrow() == BootProgress::Pending
    }

    fn waiter(&self) -> BootWaiter {
        BootWaiter {
            rx: self.progress.subscribe(),
        }
    }

    fn reject(&self, reason: &str) {
        self.progress.send_if_modified(|progress| {
            if *progress == BootProgress::Pending {
                *progress = BootProgress::Failed(reason.to_string());
                true
            } else {
                false
            }
        });
    }
}

enum BootFailure {
    Superseded,
    Build(String),
    Start(String),
}

struct InstanceState {
    status: InstanceStatus,
    detail: Option<String>,
    idle_since: DateTime<Utc>,
    worker: Option<Arc<WorkerProcess>>,
    boot: Option<BootAttempt>,
    generation: u64,
    reported_players: Option<usize>,
    worker_status: Option<Value>,
    last_heartbeat: Option<DateTime<Utc>>,
}

/// Point-in-time view of an instance, for operators and the reaper.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    /// Identity
    #[serde(flatten)]
    pub info: InstanceInfo,
    /// Lifecycle status
    pub status: InstanceStatus,
    /// Failure detail
    pub detail: Option<String>,
    /// Last activity or transition
    pub idle_since: DateTime<Utc>,
    /// Live player sockets
    pub connections: usize,
    /// Player count from the worker's last status report
    pub reported_players: Option<usize>,
    /// Worker's last status report
    pub worker_status: Option<Value>,
    /// Last heartbeat received
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Worker OS pid
    pub worker_pid: Option<u32>,
}

/// One game session.
pub struct Instance {
    info: InstanceInfo,
    services: Arc<HostServices>,
    connections: Arc<ConnectionManager>,
    state: Mutex<InstanceState>,
    retired: AtomicBool,
}

impl Instance {
    /// Create an instance in [`InstanceStatus::New`]. Nothing is booted.
    pub fn new(info: InstanceInfo, services: Arc<HostServices>) -> Arc<Self> {
        let connections = Arc::new(ConnectionManager::new(info.id.clone()));
        Arc::new(Self {
            info,
            services,
            connections,
            state: Mutex::new(InstanceState {
                status: InstanceStatus::New,
                detail: None,
                idle_since: Utc::now(),
                worker: None,
                boot: None,
                generation: 0,
                reported_players: None,
                worker_status: None,
                last_heartbeat: None,
            }),
            retired: AtomicBool::new(false),
        })
    }

    /// Instance ID.
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Immutable identity.
    pub fn info(&self) -> &InstanceInfo {
        &self.info
    }

    /// Player relay.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Mark the instance as removed from the registry.
    ///
    /// A retired instance is never booted again and refuses new players, so a
    /// handle resolved before removal cannot bring an unreachable worker up.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Whether [`retire`](Self::retire) was called.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Current status.
    pub async fn status(&self) -> InstanceStatus {
        self.state.lock().await.status
    }

    /// Detail recorded with the current status, if any.
    pub async fn detail(&self) -> Option<String> {
        self.state.lock().await.detail.clone()
    }

    /// Last activity or transition.
    pub async fn idle_since(&self) -> DateTime<Utc> {
        self.state.lock().await.idle_since
    }

    /// Player count from the worker's last status report.
    pub async fn reported_players(&self) -> Option<usize> {
        self.state.lock().await.reported_players
    }

    /// Current worker, if one is installed.
    pub async fn worker(&self) -> Option<Arc<WorkerProcess>> {
        self.state.lock().await.worker.clone()
    }

    /// Reset the idle timestamp.
    pub async fn bump_idle(&self) {
        self.state.lock().await.idle_since = Utc::now();
    }

    /// Start a boot attempt, or join the one in flight.
    pub async fn boot(self: &Arc<Self>, restart: bool) -> BootWaiter {
        let mut state = self.state.lock().await;
        self.boot_locked(&mut state, restart)
    }

    fn boot_locked(self: &Arc<Self>, state: &mut InstanceState, restart: bool) -> BootWaiter {
        if let Some(attempt) = &state.boot
            && attempt.is_pending()
        {
            return attempt.waiter();
        }

        state.generation += 1;
        let generation = state.generation;
        let (progress, _) = watch::channel(BootProgress::Pending);
        let attempt = BootAttempt {
            generation,
            progress,
        };
        let waiter = attempt.waiter();
        state.boot = Some(attempt);
        if restart {
            self.set_status(state, InstanceStatus::Restarting, None);
        }

        info!(instance_id = %self.info.id, generation, restart, "Boot attempt started");
        let instance = self.clone();
        tokio::spawn(async move {
            let outcome = instance.boot_sequence(generation, restart).await;
            instance.finish_boot(generation, outcome).await;
        });
        waiter
    }

    /// Wait for the current boot attempt, or report the settled state.
    pub async fn await_booted(&self) -> Result<(), ConnectError> {
        let waiter = {
            let state = self.state.lock().await;
            match &state.boot {
                Some(attempt) if attempt.is_pending() => attempt.waiter(),
                _ => return Self::settled(&state),
            }
        };
        waiter.wait().await
    }

    fn settled(state: &InstanceState) -> Result<(), ConnectError> {
        match state.status {
            InstanceStatus::Started => Ok(()),
            status => Err(ConnectError::FailedToStart(
                state
                    .detail
                    .clone()
                    .unwrap_or_else(|| status.as_str().to_string()),
            )),
        }
    }

    /// Make sure the instance is running, booting or reviving it as needed.
    ///
    /// A shut-down instance is restarted. A failed one (`BuildFailed` or
    /// `FailedToStart`) is reported as "failed to start" and left alone until
    /// an operator restart; connection attempts never trigger a rebuild.
    /// A retired instance reports [`ConnectError::NoSuchInstance`].
    pub async fn ensure_running(self: &Arc<Self>) -> Result<(), ConnectError> {
        let waiter = {
            let mut state = self.state.lock().await;
            if self.is_retired() {
                return Err(ConnectError::NoSuchInstance(self.info.id.clone()));
            }
            match state.status {
                InstanceStatus::Started => return Ok(()),
                InstanceStatus::New => self.boot_locked(&mut state, false),
                InstanceStatus::ShutDown => {
                    info!(instance_id = %self.info.id, "Reviving shut-down instance");
                    self.boot_locked(&mut state, true)
                }
                InstanceStatus::BuildFailed | InstanceStatus::FailedToStart => {
                    return Self::settled(&state);
                }
                InstanceStatus::FetchingWorld
                | InstanceStatus::BuildingWorld
                | InstanceStatus::Booting
                | InstanceStatus::Restarting
                | InstanceStatus::RebuildingWorld
                | InstanceStatus::Rebooting => match &state.boot {
                    Some(attempt) if attempt.is_pending() => attempt.waiter(),
                    _ => return Self::settled(&state),
                },
            }
        };
        waiter.wait().await
    }

    /// Tear down the worker and boot a new one.
    ///
    /// Players stay connected; the relay target switches once the new worker
    /// is up. An in-flight boot is rejected with "restarting".
    pub async fn restart(self: &Arc<Self>) -> BootWaiter {
        let mut state = self.state.lock().await;
        if let Some(attempt) = state.boot.take() {
            attempt.reject("restarting");
        }
        let old = state.worker.take();
        state.reported_players = None;
        state.worker_status = None;

        self.connections.detach_worker().await;
        if let Some(worker) = old {
            worker.destroy().await;
        }
        info!(instance_id = %self.info.id, "Restarting instance");
        self.boot_locked(&mut state, true)
    }

    /// Shut down: destroy the worker and close every player socket. Idempotent.
    ///
    /// Returns whether this call performed the shutdown.
    pub async fn shutdown(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status == InstanceStatus::ShutDown {
            let stragglers = self
                .connections
                .close_all(CLOSE_GOING_AWAY, "instance shut down")
                .await;
            if stragglers > 0 {
                warn!(instance_id = %self.info.id, count = stragglers, "Closed sockets left on a shut-down instance");
            }
            return false;
        }
        if let Some(attempt) = state.boot.take() {
            attempt.reject("shut down");
        }
        state.generation += 1;
        let old = state.worker.take();
        state.reported_players = None;
        state.worker_status = None;
        self.set_status(&mut state, InstanceStatus::ShutDown, None);

        self.connections.detach_worker().await;
        if let Some(worker) = old {
            worker.destroy().await;
        }
        self.connections
            .close_all(CLOSE_GOING_AWAY, "instance shut down")
            .await;
        true
    }

    /// Register a verified player socket.
    ///
    /// Only a started or booting instance takes new players. The check and the
    /// insert happen under the state lock, so a concurrent shutdown either
    /// closes the new socket or is seen here.
    pub async fn register_connection(
        &self,
        transport: Arc<dyn Transport>,
        identity: PlayerIdentity,
    ) -> Result<ConnectionId, ConnectError> {
        let mut state = self.state.lock().await;
        if self.is_retired() {
            return Err(ConnectError::NoSuchInstance(self.info.id.clone()));
        }
        if !state.status.is_booting() {
            Self::settled(&state)?;
        }
        state.idle_since = Utc::now();
        let connection_id = self
            .connections
            .register_connection(transport, identity)
            .await;
        Ok(connection_id)
    }

    /// Handle one text frame from a player.
    pub async fn handle_client_message(&self, connection_id: &str, text: &str) -> bool {
        self.bump_idle().await;
        self.connections.handle_inbound(connection_id, text).await
    }

    /// A player socket closed.
    pub async fn connection_closed(&self, connection_id: &str) {
        if !self.connections.unregister(connection_id).await {
            return;
        }
        self.bump_idle().await;
        if self.info.flags.close_on_empty && self.connections.is_empty().await {
            info!(instance_id = %self.info.id, "Last player left; closing instance");
            self.shutdown().await;
        }
    }

    /// Point-in-time view.
    pub async fn snapshot(&self) -> InstanceSnapshot {
        let connections = self.connections.len().await;
        let state = self.state.lock().await;
        InstanceSnapshot {
            info: self.info.clone(),
            status: state.status,
            detail: state.detail.clone(),
            idle_since: state.idle_since,
            connections,
            reported_players: state.reported_players,
            worker_status: state.worker_status.clone(),
            last_heartbeat: state.last_heartbeat,
            worker_pid: state.worker.as_ref().and_then(|w| w.pid()),
        }
    }

    fn set_status(&self, state: &mut InstanceState, next: InstanceStatus, detail: Option<String>) {
        if !state.status.can_transition_to(next) {
            warn!(
                instance_id = %self.info.id,
                from = %state.status,
                to = %next,
                "Unexpected status transition"
            );
        }
        info!(
            instance_id = %self.info.id,
            from = %state.status,
            to = %next,
            detail = detail.as_deref().unwrap_or(""),
            "Instance status changed"
        );
        state.status = next;
        state.detail = detail;
        state.idle_since = Utc::now();
    }

    async fn advance(&self, generation: u64, next: InstanceStatus) -> Result<(), BootFailure> {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return Err(BootFailure::Superseded);
        }
        self.set_status(&mut state, next, None);
        Ok(())
    }

    async fn install_worker(&self, generation: u64, worker: &Arc<WorkerProcess>) -> bool {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return false;
        }
        state.worker = Some(worker.clone());
        true
    }

    async fn boot_sequence(
        self: &Arc<Self>,
        generation: u64,
        restart: bool,
    ) -> Result<Arc<WorkerProcess>, BootFailure> {
        let (fetch_status, build_status, boot_status) = if restart {
            (
                InstanceStatus::Restarting,
                InstanceStatus::RebuildingWorld,
                InstanceStatus::Rebooting,
            )
        } else {
            (
                InstanceStatus::FetchingWorld,
                InstanceStatus::BuildingWorld,
                InstanceStatus::Booting,
            )
        };
        let services = &self.services;
        let world = &self.info.world;
        let world_dir = services.settings.data_dir.join("worlds").join(&self.info.id);

        let keep_edits = self.info.flags.edit_mode
            && services.provisioner.has_uncommitted_changes(&world_dir).await;
        if keep_edits {
            info!(instance_id = %self.info.id, "Keeping uncommitted edits; skipping fetch");
        } else {
            self.advance(generation, fetch_status).await?;
            services
                .provisioner
                .fetch(world, &world_dir)
                .await
                .map_err(|e| BootFailure::Build(e.to_string()))?;
        }

        self.advance(generation, build_status).await?;
        let bundle = services
            .provisioner
            .build(world, &world_dir)
            .await
            .map_err(|e| BootFailure::Build(e.to_string()))?;

        self.advance(generation, boot_status).await?;
        let worker = WorkerProcess::prepare(
            WorkerConfig {
                instance_id: self.info.id.clone(),
                world_id: world.world_id.clone(),
                variant: world.variant.clone(),
                world_dir: bundle.dir,
                entrypoint: bundle.entrypoint,
                tmp_root: services.settings.data_dir.join("tmp"),
                connect_url: services.settings.connect_url.clone(),
                connect_host: services.settings.connect_host.clone(),
                debug: self.info.flags.debug_mode,
            },
            services.pool.clone(),
        )
        .await
        .map_err(|e| BootFailure::Start(e.to_string()))?;

        if !self.install_worker(generation, &worker).await {
            worker.destroy().await;
            return Err(BootFailure::Superseded);
        }

        let subscription = worker.subscribe(OpFilter::All).await;
        tokio::spawn(relay::run(self.clone(), worker.clone(), subscription));

        worker
            .start(services.launcher.as_ref())
            .await
            .map_err(|e| BootFailure::Start(e.to_string()))?;

        tokio::select! {
            _ = worker.wait_ready() => Ok(worker),
            code = worker.wait_exit() => Err(BootFailure::Start(match code {
                Some(code) => format!("worker exited before coming up (exit code {code})"),
                None => "worker exited before coming up".to_string(),
            })),
        }
    }

    async fn finish_boot(&self, generation: u64, outcome: Result<Arc<WorkerProcess>, BootFailure>) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            drop(state);
            if let Ok(worker) = outcome {
                worker.destroy().await;
            }
            return;
        }

        // The worker may have died between WorkerUp and this point.
        let outcome = match outcome {
            Ok(worker) if worker.exit_status() != WorkerExit::Running => Err(BootFailure::Start(
                "worker exited right after coming up".to_string(),
            )),
            other => other,
        };

        let result = match outcome {
            Ok(worker) => {
                self.connections.attach_worker(worker).await;
                self.set_status(&mut state, InstanceStatus::Started, None);
                BootProgress::Booted
            }
            Err(BootFailure::Superseded) => return,
            Err(BootFailure::Build(detail)) => {
                warn!(instance_id = %self.info.id, detail = %detail, "World build failed");
                self.set_status(&mut state, InstanceStatus::BuildFailed, Some(detail.clone()));
                BootProgress::Failed(detail)
            }
            Err(BootFailure::Start(detail)) => {
                warn!(instance_id = %self.info.id, detail = %detail, "Worker failed to start");
                if let Some(worker) = state.worker.take() {
                    worker.destroy().await;
                }
                self.set_status(&mut state, InstanceStatus::FailedToStart, Some(detail.clone()));
                BootProgress::Failed(detail)
            }
        };

        if let Some(attempt) = &state.boot
            && attempt.generation == generation
        {
            attempt.progress.send_replace(result);
        }
    }

    pub(crate) async fn record_status(&self, worker: &Arc<WorkerProcess>, status: Value) {
        let mut state = self.state.lock().await;
        if !is_current(&state, worker) {
            return;
        }
        let players = reported_player_count(&status);
        if players.is_some_and(|n| n > 0) {
            state.idle_since = Utc::now();
        }
        state.reported_players = players.or(state.reported_players);
        state.worker_status = Some(status);
    }

    pub(crate) async fn record_heartbeat(&self, worker: &Arc<WorkerProcess>) {
        let mut state = self.state.lock().await;
        if is_current(&state, worker) {
            state.last_heartbeat = Some(Utc::now());
        }
    }

    /// The worker's message bus ended: the process is gone.
    pub(crate) async fn worker_lost(&self, worker: &Arc<WorkerProcess>) {
        let mut state = self.state.lock().await;
        if !is_current(&state, worker) || state.status != InstanceStatus::Started {
            return;
        }
        state.worker = None;
        state.reported_players = None;
        self.connections.detach_worker_if(worker).await;
        let detail = match worker.exit_status() {
            WorkerExit::Exited(Some(code)) => {
                format!("worker exited unexpectedly (exit code {code})")
            }
            _ => "worker exited unexpectedly".to_string(),
        };
        warn!(instance_id = %self.info.id, detail = %detail, "Worker lost");
        self.set_status(&mut state, InstanceStatus::FailedToStart, Some(detail));
    }

    pub(crate) fn kv(&self) -> &Arc<dyn KvStore> {
        &self.services.kv
    }
}

fn is_current(state: &InstanceState, worker: &Arc<WorkerProcess>) -> bool {
    state
        .worker
        .as_ref()
        .is_some_and(|current| Arc::ptr_eq(current, worker))
}
