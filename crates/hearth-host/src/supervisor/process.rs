// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A supervised worker: one subprocess, one replaceable transport, one message bus.
//!
//! The subprocess, not the transport, is the unit of identity. The worker may
//! drop its WebSocket and reconnect with the same capability token; the new
//! transport supersedes the old one and the process keeps its state.
//!
//! Lifecycle:
//!
//! ```text
//! prepare() ──► start(launcher) ──► [accept_transport ⇄ transport_closed]* ──► destroy()
//!    │               │                                                          │
//!    │ pool entry    │ stdio capture + exit watcher                             │
//!    │ temp dir      │                                                          ▼
//!    └───────────────┴──────────────► cleanup() ◄─────── process exits on its own
//! ```
//!
//! `cleanup` runs at most once, whichever path reaches it first.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use hearth_protocol::{ControlMessage, OpKind};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use super::{LaunchOptions, OutputStream, Result, SupervisorError, WorkerLauncher, WorkerPool};
use crate::transport::{CLOSE_GOING_AWAY, CLOSE_REPLACED, Transport};

/// Identifies one accepted transport of a worker.
pub type TransportId = u64;

/// Identifies one bus subscription.
pub type ListenerId = u64;

/// Everything needed to prepare a worker, minus the generated token and temp dir.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Instance ID
    pub instance_id: String,
    /// World ID
    pub world_id: String,
    /// World variant
    pub variant: String,
    /// World working tree
    pub world_dir: PathBuf,
    /// Worker entrypoint
    pub entrypoint: PathBuf,
    /// Parent directory for the per-worker temp dir
    pub tmp_root: PathBuf,
    /// WebSocket URL of the worker callback route
    pub connect_url: String,
    /// host:port of the callback route
    pub connect_host: String,
    /// Debug mode
    pub debug: bool,
}

/// Which ops a subscription receives.
#[derive(Debug, Clone, Copy)]
pub enum OpFilter {
    /// Every message.
    All,
    /// Only the listed ops.
    Only(&'static [OpKind]),
}

impl OpFilter {
    fn matches(&self, kind: OpKind) -> bool {
        match self {
            OpFilter::All => true,
            OpFilter::Only(kinds) => kinds.contains(&kind),
        }
    }
}

/// Receiving end of a bus subscription. Ends when the worker is cleaned up.
pub struct Subscription {
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<Arc<ControlMessage>>,
}

impl Subscription {
    /// Subscription id, for [`WorkerProcess::unsubscribe`].
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Next message, or `None` once the worker is gone.
    pub async fn recv(&mut self) -> Option<Arc<ControlMessage>> {
        self.rx.recv().await
    }

    /// Next already-queued message, if any.
    pub fn try_recv(&mut self) -> Option<Arc<ControlMessage>> {
        self.rx.try_recv().ok()
    }
}

/// Process state as seen by the exit watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Still running (or never started).
    Running,
    /// Exited, with its exit code if it had one.
    Exited(Option<i32>),
}

struct ActiveTransport {
    id: TransportId,
    transport: Arc<dyn Transport>,
}

struct Listener {
    id: ListenerId,
    filter: OpFilter,
    tx: mpsc::UnboundedSender<Arc<ControlMessage>>,
}

/// One worker subprocess and its control channel.
pub struct WorkerProcess {
    options: LaunchOptions,
    pool: Arc<WorkerPool>,
    pid: OnceLock<u32>,
    transport: Mutex<Option<ActiveTransport>>,
    next_transport_id: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
    next_listener_id: AtomicU64,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    ready: watch::Sender<bool>,
    exit: watch::Sender<WorkerExit>,
    destroyed: AtomicBool,
    cleaned_up: AtomicBool,
}

/// Random bearer token a worker uses to find its supervisor.
pub fn generate_capability_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

impl WorkerProcess {
    /// Create the worker's temp dir and register it in `pool`.
    ///
    /// Nothing is spawned yet; subscribe first, then call [`start`](Self::start),
    /// so no early message is missed.
    pub async fn prepare(config: WorkerConfig, pool: Arc<WorkerPool>) -> Result<Arc<Self>> {
        let capability_token = generate_capability_token();
        let temp_dir = config
            .tmp_root
            .join(format!("{}-{}", config.instance_id, &capability_token[..8]));
        tokio::fs::create_dir_all(&temp_dir).await?;

        let options = LaunchOptions {
            instance_id: config.instance_id,
            world_id: config.world_id,
            variant: config.variant,
            world_dir: config.world_dir,
            entrypoint: config.entrypoint,
            temp_dir,
            connect_url: config.connect_url,
            connect_host: config.connect_host,
            capability_token,
            debug: config.debug,
        };

        let worker = Arc::new(Self {
            options,
            pool: pool.clone(),
            pid: OnceLock::new(),
            transport: Mutex::new(None),
            next_transport_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            kill_tx: Mutex::new(None),
            ready: watch::Sender::new(false),
            exit: watch::Sender::new(WorkerExit::Running),
            destroyed: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
        });
        pool.register(worker.clone());

        debug!(
            instance_id = %worker.options.instance_id,
            temp_dir = %worker.options.temp_dir.display(),
            "Worker prepared"
        );
        Ok(worker)
    }

    /// Launch the subprocess and start stdio capture and the exit watcher.
    pub async fn start(self: &Arc<Self>, launcher: &dyn WorkerLauncher) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SupervisorError::Destroyed);
        }

        let mut handle = match launcher.launch(&self.options).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(instance_id = %self.options.instance_id, error = %e, "Worker launch failed");
                self.cleanup().await;
                return Err(e);
            }
        };

        if let Some(pid) = handle.pid() {
            let _ = self.pid.set(pid);
        }
        if let Some(stdout) = handle.take_stdout() {
            tokio::spawn(capture_output(
                self.options.instance_id.clone(),
                "stdout",
                stdout,
            ));
        }
        if let Some(stderr) = handle.take_stderr() {
            tokio::spawn(capture_output(
                self.options.instance_id.clone(),
                "stderr",
                stderr,
            ));
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        *self.kill_tx.lock().await = Some(kill_tx);
        // destroy() may have raced the launch and found no kill switch yet.
        if self.destroyed.load(Ordering::SeqCst)
            && let Some(tx) = self.kill_tx.lock().await.take()
        {
            let _ = tx.send(());
        }

        let worker = self.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = handle.wait() => Some(status),
                _ = kill_rx => None,
            };
            let code = match outcome {
                Some(Ok(code)) => {
                    warn!(
                        instance_id = %worker.options.instance_id,
                        exit_code = ?code,
                        "Worker process exited"
                    );
                    code
                }
                Some(Err(e)) => {
                    error!(instance_id = %worker.options.instance_id, error = %e, "Error waiting for worker");
                    None
                }
                None => {
                    if let Err(e) = handle.kill().await {
                        warn!(instance_id = %worker.options.instance_id, error = %e, "Failed to kill worker");
                    }
                    info!(instance_id = %worker.options.instance_id, "Worker process terminated");
                    None
                }
            };
            worker.exit.send_replace(WorkerExit::Exited(code));
            worker.cleanup().await;
        });

        info!(
            instance_id = %self.options.instance_id,
            pid = ?self.pid(),
            launcher = launcher.launcher_type(),
            "Worker started"
        );
        Ok(())
    }

    /// Install `transport` as the live channel, closing any previous one as "replaced".
    pub async fn accept_transport(&self, transport: Arc<dyn Transport>) -> Result<TransportId> {
        // cleanup() flips the flag while holding this lock.
        let mut slot = self.transport.lock().await;
        if self.cleaned_up.load(Ordering::SeqCst) {
            transport.close(CLOSE_GOING_AWAY, "worker shut down");
            return Err(SupervisorError::Destroyed);
        }

        let id = self.next_transport_id.fetch_add(1, Ordering::SeqCst);
        let previous = slot.replace(ActiveTransport { id, transport });
        drop(slot);

        match previous {
            Some(old) => {
                old.transport.close(CLOSE_REPLACED, "replaced");
                info!(
                    instance_id = %self.options.instance_id,
                    transport_id = id,
                    replaced = old.id,
                    "Worker transport replaced"
                );
            }
            None => {
                info!(
                    instance_id = %self.options.instance_id,
                    transport_id = id,
                    "Worker transport connected"
                );
            }
        }
        Ok(id)
    }

    /// Forget transport `id` if it is still the live one.
    pub async fn transport_closed(&self, id: TransportId) {
        let mut slot = self.transport.lock().await;
        if slot.as_ref().is_some_and(|active| active.id == id) {
            *slot = None;
            info!(
                instance_id = %self.options.instance_id,
                transport_id = id,
                "Worker transport dropped; waiting for reconnect"
            );
        }
    }

    /// Whether a transport is currently installed.
    pub async fn has_transport(&self) -> bool {
        self.transport.lock().await.is_some()
    }

    /// Send to the worker. Best-effort: dropped if no transport is live.
    pub async fn send(&self, message: &ControlMessage) -> bool {
        let slot = self.transport.lock().await;
        let Some(active) = slot.as_ref() else {
            trace!(
                instance_id = %self.options.instance_id,
                op = %message.kind(),
                "No worker transport; dropping message"
            );
            return false;
        };
        match message.to_json() {
            Ok(text) => match active.transport.send(text) {
                Ok(()) => true,
                Err(e) => {
                    debug!(instance_id = %self.options.instance_id, error = %e, "Worker send failed");
                    false
                }
            },
            Err(e) => {
                warn!(instance_id = %self.options.instance_id, error = %e, "Failed to encode control message");
                false
            }
        }
    }

    /// Decode one inbound frame and publish it to subscribers.
    ///
    /// Malformed or unknown messages are dropped; returns whether the frame was accepted.
    pub async fn handle_message(&self, text: &str) -> bool {
        match ControlMessage::from_json(text) {
            Ok(message) => {
                self.dispatch(message).await;
                true
            }
            Err(e) => {
                warn!(
                    instance_id = %self.options.instance_id,
                    error = %e,
                    "Dropping invalid control message from worker"
                );
                false
            }
        }
    }

    /// Publish an already-decoded message.
    pub async fn dispatch(&self, message: ControlMessage) {
        let kind = message.kind();
        if kind == OpKind::WorkerUp {
            self.ready.send_replace(true);
        }
        let message = Arc::new(message);
        self.listeners
            .lock()
            .await
            .retain(|listener| !listener.filter.matches(kind) || listener.tx.send(message.clone()).is_ok());
    }

    /// Subscribe to messages matching `filter`.
    pub async fn subscribe(&self, filter: OpFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let mut listeners = self.listeners.lock().await;
        // After cleanup the sender is dropped here, so the subscription ends at once.
        if !self.cleaned_up.load(Ordering::SeqCst) {
            listeners.push(Listener { id, filter, tx });
        }
        Subscription { id, rx }
    }

    /// Remove a subscription. Returns whether it existed.
    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().await;
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    /// Resolves once the worker has reported `WorkerUp`.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Resolves once the process has exited, with its exit code.
    pub async fn wait_exit(&self) -> Option<i32> {
        let mut rx = self.exit.subscribe();
        match rx.wait_for(|exit| matches!(exit, WorkerExit::Exited(_))).await {
            Ok(exit) => match *exit {
                WorkerExit::Exited(code) => code,
                WorkerExit::Running => None,
            },
            Err(_) => None,
        }
    }

    /// Whether `WorkerUp` has been received.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Current process state.
    pub fn exit_status(&self) -> WorkerExit {
        *self.exit.borrow()
    }

    /// Terminate the process and release its resources. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(instance_id = %self.options.instance_id, pid = ?self.pid(), "Destroying worker");
        if let Some(tx) = self.kill_tx.lock().await.take() {
            let _ = tx.send(());
        }
        self.cleanup().await;
    }

    async fn cleanup(&self) {
        // Lock order: transport, then listeners.
        let mut slot = self.transport.lock().await;
        let mut listeners = self.listeners.lock().await;
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        let active = slot.take();
        listeners.clear();
        drop(listeners);
        drop(slot);

        self.pool.remove(&self.options.capability_token);
        if let Some(active) = active {
            active.transport.close(CLOSE_GOING_AWAY, "worker shut down");
        }

        let temp_dir = self.options.temp_dir.clone();
        let instance_id = self.options.instance_id.clone();
        tokio::spawn(async move {
            match tokio::fs::remove_dir_all(&temp_dir).await {
                Ok(()) => debug!(instance_id = %instance_id, path = %temp_dir.display(), "Removed worker temp dir"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    instance_id = %instance_id,
                    path = %temp_dir.display(),
                    error = %e,
                    "Failed to remove worker temp dir"
                ),
            }
        });
    }

    /// Instance this worker belongs to.
    pub fn instance_id(&self) -> &str {
        &self.options.instance_id
    }

    /// Bearer token for the callback route.
    pub fn capability_token(&self) -> &str {
        &self.options.capability_token
    }

    /// World working tree.
    pub fn work_dir(&self) -> &Path {
        &self.options.world_dir
    }

    /// Scratch directory.
    pub fn temp_dir(&self) -> &Path {
        &self.options.temp_dir
    }

    /// OS process id, once launched.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Whether `destroy` has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

async fn capture_output(instance_id: String, stream: &'static str, output: OutputStream) {
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if stream == "stderr" {
                    warn!(target: "worker", instance_id = %instance_id, stream = stream, "{}", line);
                } else {
                    info!(target: "worker", instance_id = %instance_id, stream = stream, "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(instance_id = %instance_id, stream = stream, error = %e, "Worker output closed");
                break;
            }
        }
    }
}
