// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker launch backends.
//!
//! Launchers are pure process spawners: they know nothing about transports,
//! players or instance state. [`super::WorkerProcess`] owns what they return.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{Result, SupervisorError};

/// Boxed stdio stream of a worker.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Everything a worker needs to start and call home.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Instance ID
    pub instance_id: String,
    /// World ID
    pub world_id: String,
    /// World variant
    pub variant: String,
    /// World working tree (read-only for the worker)
    pub world_dir: PathBuf,
    /// Worker entrypoint
    pub entrypoint: PathBuf,
    /// Scratch directory (the only writable path)
    pub temp_dir: PathBuf,
    /// WebSocket URL of the worker callback route
    pub connect_url: String,
    /// host:port of the callback route (network allow-list)
    pub connect_host: String,
    /// Bearer token the worker presents on connect
    pub capability_token: String,
    /// Debug mode
    pub debug: bool,
}

impl LaunchOptions {
    /// JSON environment blob passed as `HEARTH_WORKER_ENV`.
    pub fn env_blob(&self) -> String {
        serde_json::json!({
            "instanceId": self.instance_id,
            "worldId": self.world_id,
            "variant": self.variant,
            "connectUrl": self.connect_url,
            "capabilityToken": self.capability_token,
            "tempDir": self.temp_dir,
            "debug": self.debug,
        })
        .to_string()
    }
}

/// A launched worker process.
#[async_trait]
pub trait WorkerHandle: Send {
    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Take the stdout stream (once).
    fn take_stdout(&mut self) -> Option<OutputStream>;

    /// Take the stderr stream (once).
    fn take_stderr(&mut self) -> Option<OutputStream>;

    /// Wait for the process to exit. Returns the exit code if it had one.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Terminate the process and reap it.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// Launches worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launcher type identifier (e.g., "process", "fake")
    fn launcher_type(&self) -> &'static str;

    /// Start a worker for `options`.
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn WorkerHandle>>;
}

/// Process launcher configuration
#[derive(Debug, Clone)]
pub struct ProcessLauncherConfig {
    /// Worker executable
    pub program: String,
    /// Extra arguments inserted before the entrypoint
    pub extra_args: Vec<String>,
    /// Time between SIGTERM and SIGKILL
    pub kill_grace: Duration,
}

impl Default for ProcessLauncherConfig {
    fn default() -> Self {
        Self {
            program: "deno".to_string(),
            extra_args: Vec::new(),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Launches workers as sandboxed local subprocesses.
pub struct ProcessLauncher {
    config: ProcessLauncherConfig,
}

impl ProcessLauncher {
    /// Create a new process launcher
    pub fn new(config: ProcessLauncherConfig) -> Self {
        Self { config }
    }

    /// Command-line arguments for `options`.
    ///
    /// Network access is limited to the host callback, reads to the world
    /// tree and scratch dir, writes to the scratch dir.
    pub fn build_args(&self, options: &LaunchOptions) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            format!("--allow-net={}", options.connect_host),
            format!(
                "--allow-read={},{}",
                options.world_dir.display(),
                options.temp_dir.display()
            ),
            format!("--allow-write={}", options.temp_dir.display()),
            "--allow-env=HEARTH_WORKER_ENV".to_string(),
        ];
        args.extend(self.config.extra_args.iter().cloned());
        args.push(options.entrypoint.display().to_string());
        args
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    fn launcher_type(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn WorkerHandle>> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.build_args(options))
            .current_dir(&options.world_dir)
            .env_clear()
            .env("HEARTH_WORKER_ENV", options.env_blob())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }

        let child = cmd.spawn().map_err(|e| {
            SupervisorError::SpawnFailed(format!("{}: {}", self.config.program, e))
        })?;

        debug!(
            instance_id = %options.instance_id,
            pid = ?child.id(),
            program = %self.config.program,
            "Worker process spawned"
        );

        Ok(Box::new(ChildHandle {
            child,
            kill_grace: self.config.kill_grace,
        }))
    }
}

/// [`WorkerHandle`] over a tokio child process.
struct ChildHandle {
    child: Child,
    kill_grace: Duration,
}

#[async_trait]
impl WorkerHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as OutputStream)
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        if let Some(pid) = self.child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid = pid, error = %e, "SIGTERM failed");
            }
            if tokio::time::timeout(self.kill_grace, self.child.wait())
                .await
                .is_ok()
            {
                return Ok(());
            }
            warn!(pid = pid, "Worker ignored SIGTERM, sending SIGKILL");
        }
        self.child.kill().await
    }
}
