// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that shuts down idle instances.
//!
//! Every tick each instance is checked independently:
//! - edit-mode instances are never reaped
//! - an instance that is not `Started` and has been idle longer than
//!   `idle_not_started` is reaped (this also ends stuck boots)
//! - an instance whose worker reports zero players (or that is `Started` and
//!   has not reported yet) and has been idle longer than `idle_no_players`
//!   is reaped
//!
//! A reaped instance is removed from the registry (which retires it) before
//! it is shut down, so a player connecting mid-teardown gets "no such
//! instance" instead of reviving it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::instance::InstanceStatus;
use crate::registry::InstanceRegistry;

/// Configuration for the reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to scan the registry.
    pub poll_interval: Duration,
    /// Idle limit for instances that are not `Started`.
    pub idle_not_started: Duration,
    /// Idle limit for instances without players.
    pub idle_no_players: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            idle_not_started: Duration::from_secs(600), // 10 minutes
            idle_no_players: Duration::from_secs(300),  // 5 minutes
        }
    }
}

/// Shortest pause between scans, whatever the configured interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

impl ReaperConfig {
    /// `poll_interval`, floored at [`MIN_POLL_INTERVAL`].
    pub fn effective_poll_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }
}

/// Why an instance was reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    /// Not started and idle too long.
    NotStarted,
    /// No players and idle too long.
    NoPlayers,
}

/// Decide whether an instance should be reaped.
pub fn reap_reason(
    config: &ReaperConfig,
    status: InstanceStatus,
    edit_mode: bool,
    reported_players: Option<usize>,
    idle_for: Duration,
) -> Option<ReapReason> {
    if edit_mode {
        return None;
    }
    if status != InstanceStatus::Started && idle_for > config.idle_not_started {
        return Some(ReapReason::NotStarted);
    }
    // Without a status report only a started worker counts as empty.
    let no_players = match reported_players {
        Some(count) => count == 0,
        None => status == InstanceStatus::Started,
    };
    if no_players && idle_for > config.idle_no_players {
        return Some(ReapReason::NoPlayers);
    }
    None
}

/// Background worker that shuts down idle instances.
pub struct Reaper {
    registry: Arc<InstanceRegistry>,
    config: ReaperConfig,
    shutdown: Arc<Notify>,
}

impl Reaper {
    /// Create a new reaper.
    pub fn new(registry: Arc<InstanceRegistry>, config: ReaperConfig) -> Self {
        Self {
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            idle_not_started_secs = self.config.idle_not_started.as_secs(),
            idle_no_players_secs = self.config.idle_no_players.as_secs(),
            "Reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.effective_poll_interval()) => {
                    self.scan(Utc::now()).await;
                }
            }
        }

        info!("Reaper stopped");
    }

    /// Reap every idle instance as of `now`. Returns the reaped ids.
    pub async fn scan(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut reaped = Vec::new();

        for instance in self.registry.list() {
            let idle_for = (now - instance.idle_since().await)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let reason = reap_reason(
                &self.config,
                instance.status().await,
                instance.info().flags.edit_mode,
                instance.reported_players().await,
                idle_for,
            );
            let Some(reason) = reason else {
                continue;
            };

            // Another path may have removed it since list().
            if self.registry.remove(instance.id()).is_none() {
                continue;
            }
            info!(
                instance_id = %instance.id(),
                reason = ?reason,
                idle_secs = idle_for.as_secs(),
                "Reaping idle instance"
            );
            instance.shutdown().await;
            reaped.push(instance.id().to_string());
        }

        if reaped.is_empty() {
            debug!("Reaper cycle completed, nothing idle");
        } else {
            info!(reaped = reaped.len(), "Reaper cycle completed");
        }
        reaped
    }
}
