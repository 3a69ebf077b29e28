// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for hearth-host integration tests.
//!
//! Provides a fake launcher that "runs" workers in-process, a fake
//! provisioner with a release gate, and a [`TestHost`] that wires them into a
//! registry the same way `HostRuntime` does.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use hearth_host::connections::PlayerIdentity;
use hearth_host::instance::{
    CreateInstance, HostServices, HostSettings, Instance, InstanceFlags,
};
use hearth_host::kv::MemoryKvStore;
use hearth_host::provision::{ProvisionError, WorldBundle, WorldProvisioner, WorldRef};
use hearth_host::registry::InstanceRegistry;
use hearth_host::supervisor::{
    LaunchOptions, OutputStream, SupervisorError, WorkerHandle, WorkerLauncher, WorkerPool,
};
use hearth_host::transport::{ChannelTransport, Outbound};

/// How the fake launcher behaves on the next launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Connect a transport and report `WorkerUp` immediately.
    Up,
    /// Fail to spawn.
    Fail,
    /// Exit with code 1 before reporting `WorkerUp`.
    ExitBeforeUp,
    /// Spawn but never connect.
    Silent,
}

/// In-process stand-in for a worker subprocess.
pub struct FakeLauncher {
    pool: Arc<WorkerPool>,
    mode: Mutex<LaunchMode>,
    launches: AtomicUsize,
    kills: Arc<AtomicUsize>,
    worker_rx: Mutex<HashMap<String, mpsc::UnboundedReceiver<Outbound>>>,
    exits: Mutex<HashMap<String, oneshot::Sender<Option<i32>>>>,
}

impl FakeLauncher {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            mode: Mutex::new(LaunchMode::Up),
            launches: AtomicUsize::new(0),
            kills: Arc::new(AtomicUsize::new(0)),
            worker_rx: Mutex::new(HashMap::new()),
            exits: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_mode(&self, mode: LaunchMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// What the host sent to the latest worker of `instance_id`.
    pub fn take_worker_rx(&self, instance_id: &str) -> mpsc::UnboundedReceiver<Outbound> {
        self.worker_rx
            .lock()
            .unwrap()
            .remove(instance_id)
            .expect("no worker transport for instance")
    }

    /// Make the latest worker of `instance_id` exit on its own.
    pub fn crash(&self, instance_id: &str, code: Option<i32>) {
        if let Some(tx) = self.exits.lock().unwrap().remove(instance_id) {
            let _ = tx.send(code);
        }
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    fn launcher_type(&self) -> &'static str {
        "fake"
    }

    async fn launch(
        &self,
        options: &LaunchOptions,
    ) -> Result<Box<dyn WorkerHandle>, SupervisorError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();

        let (exit_tx, exit_rx) = oneshot::channel();
        match mode {
            LaunchMode::Fail => {
                return Err(SupervisorError::SpawnFailed("fake spawn failure".into()));
            }
            LaunchMode::ExitBeforeUp => {
                let _ = exit_tx.send(Some(1));
            }
            LaunchMode::Up => {
                let worker = self
                    .pool
                    .get(&options.capability_token)
                    .expect("worker registered before launch");
                let (transport, rx) = ChannelTransport::new();
                worker
                    .accept_transport(Arc::new(transport))
                    .await
                    .expect("transport accepted");
                self.worker_rx
                    .lock()
                    .unwrap()
                    .insert(options.instance_id.clone(), rx);
                worker.handle_message(r#"{"op":"WorkerUp"}"#).await;
                self.exits
                    .lock()
                    .unwrap()
                    .insert(options.instance_id.clone(), exit_tx);
            }
            LaunchMode::Silent => {
                self.exits
                    .lock()
                    .unwrap()
                    .insert(options.instance_id.clone(), exit_tx);
            }
        }

        Ok(Box::new(FakeHandle {
            exit_rx: Some(exit_rx),
            kills: self.kills.clone(),
        }))
    }
}

struct FakeHandle {
    exit_rx: Option<oneshot::Receiver<Option<i32>>>,
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkerHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        None
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        None
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        match self.exit_rx.take() {
            // A dropped sender means the test no longer cares; keep "running".
            Some(rx) => match rx.await {
                Ok(code) => Ok(code),
                Err(_) => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Provisioner that records calls and can hold builds until released.
pub struct FakeProvisioner {
    fetches: AtomicUsize,
    builds: AtomicUsize,
    fail_build: AtomicBool,
    dirty: AtomicBool,
    gate: watch::Sender<bool>,
}

impl FakeProvisioner {
    /// Builds complete immediately.
    pub fn new() -> Self {
        Self::with_gate(true)
    }

    /// Builds block until [`release`](Self::release).
    pub fn gated() -> Self {
        Self::with_gate(false)
    }

    fn with_gate(open: bool) -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
            fail_build: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            gate: watch::Sender::new(open),
        }
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn fail_builds(&self, fail: bool) {
        self.fail_build.store(fail, Ordering::SeqCst);
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorldProvisioner for FakeProvisioner {
    async fn has_uncommitted_changes(&self, _dir: &Path) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    async fn fetch(&self, _world: &WorldRef, dir: &Path) -> Result<(), ProvisionError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(dir).await?;
        Ok(())
    }

    async fn build(&self, _world: &WorldRef, dir: &Path) -> Result<WorldBundle, ProvisionError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(ProvisionError::Build("fake build failure".into()));
        }
        Ok(WorldBundle {
            dir: dir.to_path_buf(),
            entrypoint: dir.join("worker/main.ts"),
        })
    }
}

/// Registry wired to fakes, with its own data dir.
pub struct TestHost {
    pub registry: Arc<InstanceRegistry>,
    pub pool: Arc<WorkerPool>,
    pub launcher: Arc<FakeLauncher>,
    pub provisioner: Arc<FakeProvisioner>,
    pub kv: Arc<MemoryKvStore>,
    pub data_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_provisioner(FakeProvisioner::new())
    }

    pub fn with_provisioner(provisioner: FakeProvisioner) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let data_dir = temp_dir.path().to_path_buf();
        let pool = Arc::new(WorkerPool::new());
        let launcher = Arc::new(FakeLauncher::new(pool.clone()));
        let provisioner = Arc::new(provisioner);
        let kv = Arc::new(MemoryKvStore::new());

        let services = Arc::new(HostServices {
            provisioner: provisioner.clone(),
            launcher: launcher.clone(),
            pool: pool.clone(),
            kv: kv.clone(),
            settings: HostSettings {
                data_dir: data_dir.clone(),
                connect_url: "ws://127.0.0.1:9/internal/worker".to_string(),
                connect_host: "127.0.0.1:9".to_string(),
            },
        });

        Self {
            registry: Arc::new(InstanceRegistry::new(services)),
            pool,
            launcher,
            provisioner,
            kv,
            data_dir,
            _temp_dir: temp_dir,
        }
    }

    pub fn create(&self, flags: InstanceFlags) -> Arc<Instance> {
        self.registry.create(CreateInstance {
            world: WorldRef::new("meadow", "main"),
            flags,
            origin_instance_id: None,
            origin_world_id: None,
            started_by: Some("tester".to_string()),
        })
    }

    /// Create and boot an instance.
    pub async fn started(&self) -> Arc<Instance> {
        let instance = self.create(InstanceFlags::default());
        instance.ensure_running().await.expect("instance boots");
        instance
    }
}

pub fn player(id: &str) -> PlayerIdentity {
    PlayerIdentity {
        player_id: id.to_string(),
        nickname: Some(format!("{id}-nick")),
        character_id: None,
    }
}

/// Register a player on `instance`; returns its id and outbound queue.
pub async fn connect(
    instance: &Instance,
    id: &str,
) -> (String, mpsc::UnboundedReceiver<Outbound>) {
    let (transport, rx) = ChannelTransport::new();
    let connection_id = instance
        .register_connection(Arc::new(transport), player(id))
        .await
        .expect("instance accepts players");
    (connection_id, rx)
}

/// Next text frame, failing the test after one second.
pub async fn next_text(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> String {
    match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Some(Outbound::Text(text))) => text,
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Next frame of any kind, failing the test after one second.
pub async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Outbound {
    match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Some(frame)) => frame,
        other => panic!("expected a frame, got {other:?}"),
    }
}

/// Whether no further frame arrives within a short window. A closed queue
/// counts as quiet.
pub async fn stays_quiet(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> bool {
    !matches!(
        tokio::time::timeout(Duration::from_millis(50), rx.recv()).await,
        Ok(Some(_))
    )
}

/// Poll `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
