// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! World provisioning - fetching and building an instance's code bundle.
//!
//! Each instance gets its own working tree under `{DATA_DIR}/worlds/{instance_id}`.
//! Edit-mode instances edit that tree in place, which is why the orchestrator
//! asks [`WorldProvisioner::has_uncommitted_changes`] before fetching.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors from provisioning.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// Fetching the world source failed.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Building the world failed.
    #[error("build failed: {0}")]
    Build(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which world (and which version of it) an instance runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldRef {
    /// World id.
    pub world_id: String,
    /// Branch / variant name.
    pub variant: String,
    /// Pinned commit, if any. Otherwise the variant head is used.
    #[serde(default)]
    pub revision: Option<String>,
}

impl WorldRef {
    /// Reference the head of `variant`.
    pub fn new(world_id: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            world_id: world_id.into(),
            variant: variant.into(),
            revision: None,
        }
    }

    /// Git revision to check out.
    pub fn checkout_target(&self) -> String {
        match &self.revision {
            Some(rev) => rev.clone(),
            None => format!("origin/{}", self.variant),
        }
    }
}

/// Output of a successful build.
#[derive(Debug, Clone)]
pub struct WorldBundle {
    /// World working tree.
    pub dir: PathBuf,
    /// Worker entrypoint inside `dir`.
    pub entrypoint: PathBuf,
}

/// Fetches and builds world code for an instance.
#[async_trait]
pub trait WorldProvisioner: Send + Sync {
    /// Whether `dir` already holds a working tree with local edits.
    async fn has_uncommitted_changes(&self, dir: &Path) -> bool;

    /// Bring `dir` to the revision named by `world`, discarding local state.
    async fn fetch(&self, world: &WorldRef, dir: &Path) -> Result<(), ProvisionError>;

    /// Build the world in `dir` and locate its worker entrypoint.
    async fn build(&self, world: &WorldRef, dir: &Path) -> Result<WorldBundle, ProvisionError>;
}

/// Git provisioner configuration
#[derive(Debug, Clone)]
pub struct GitProvisionerConfig {
    /// Remote base; a world's remote is `{remote_base}/{world_id}.git`
    pub remote_base: String,
    /// Optional `sh -c` build command run inside the working tree
    pub build_command: Option<String>,
    /// Worker entrypoint relative to the working tree
    pub entrypoint: PathBuf,
}

/// Provisioner that clones worlds from git and runs an optional build command.
pub struct GitProvisioner {
    config: GitProvisionerConfig,
}

impl GitProvisioner {
    /// Create a new git provisioner
    pub fn new(config: GitProvisionerConfig) -> Self {
        Self { config }
    }

    fn remote_url(&self, world: &WorldRef) -> String {
        format!(
            "{}/{}.git",
            self.config.remote_base.trim_end_matches('/'),
            world.world_id
        )
    }

    async fn git(dir: Option<&Path>, args: &[&str]) -> Result<String, ProvisionError> {
        let mut cmd = Command::new("git");
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        cmd.args(args);
        let output = cmd.output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ProvisionError::Fetch(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                tail(&String::from_utf8_lossy(&output.stderr))
            )))
        }
    }
}

/// Last few non-empty lines of tool output, for status detail.
fn tail(output: &str) -> String {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(10);
    lines[start..].join("\n")
}

#[async_trait]
impl WorldProvisioner for GitProvisioner {
    async fn has_uncommitted_changes(&self, dir: &Path) -> bool {
        if !dir.join(".git").exists() {
            return false;
        }
        match Self::git(Some(dir), &["status", "--porcelain"]).await {
            Ok(stdout) => !stdout.trim().is_empty(),
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "git status failed; treating tree as clean");
                false
            }
        }
    }

    async fn fetch(&self, world: &WorldRef, dir: &Path) -> Result<(), ProvisionError> {
        if dir.join(".git").exists() {
            Self::git(Some(dir), &["fetch", "--prune", "origin"]).await?;
        } else {
            if let Some(parent) = dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let remote = self.remote_url(world);
            let target = dir.to_string_lossy();
            Self::git(None, &["clone", "--no-checkout", &remote, &target]).await?;
        }

        let target = world.checkout_target();
        Self::git(Some(dir), &["checkout", "--force", "--detach", &target]).await?;
        Self::git(Some(dir), &["clean", "-fdx"]).await?;

        info!(
            world_id = %world.world_id,
            target = %target,
            dir = %dir.display(),
            "Fetched world"
        );
        Ok(())
    }

    async fn build(&self, world: &WorldRef, dir: &Path) -> Result<WorldBundle, ProvisionError> {
        if let Some(command) = &self.config.build_command {
            let output = Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(dir)
                .env("HEARTH_WORLD_ID", &world.world_id)
                .env("HEARTH_WORLD_VARIANT", &world.variant)
                .output()
                .await?;
            if !output.status.success() {
                let stderr = tail(&String::from_utf8_lossy(&output.stderr));
                return Err(ProvisionError::Build(format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr
                )));
            }
            debug!(world_id = %world.world_id, "Build command completed");
        }

        let entrypoint = dir.join(&self.config.entrypoint);
        if !entrypoint.exists() {
            return Err(ProvisionError::Build(format!(
                "entrypoint not found: {}",
                entrypoint.display()
            )));
        }

        Ok(WorldBundle {
            dir: dir.to_path_buf(),
            entrypoint,
        })
    }
}
