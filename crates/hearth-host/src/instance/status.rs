// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle states and their allowed transitions.
//!
//! ```text
//! New ──► FetchingWorld ──► BuildingWorld ──► Booting ──► Started
//!  │            │                 │              │           │
//!  │            └──► BuildFailed ◄┘              └──► FailedToStart
//!  │
//!  └──► Restarting ──► RebuildingWorld ──► Rebooting ──► Started
//!
//! any state ──► Restarting | ShutDown
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, never booted.
    New,
    /// Fetching world code.
    FetchingWorld,
    /// Building world code.
    BuildingWorld,
    /// Worker spawned, waiting for `WorkerUp`.
    Booting,
    /// Worker is up and relaying.
    Started,
    /// Restart requested, fetching world code again.
    Restarting,
    /// Rebuilding world code during a restart.
    RebuildingWorld,
    /// New worker spawned during a restart.
    Rebooting,
    /// Shut down; a player connect revives it.
    ShutDown,
    /// Fetch or build failed.
    BuildFailed,
    /// The worker failed to come up or exited.
    FailedToStart,
}

impl InstanceStatus {
    /// Wire/log name.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::New => "new",
            InstanceStatus::FetchingWorld => "fetching_world",
            InstanceStatus::BuildingWorld => "building_world",
            InstanceStatus::Booting => "booting",
            InstanceStatus::Started => "started",
            InstanceStatus::Restarting => "restarting",
            InstanceStatus::RebuildingWorld => "rebuilding_world",
            InstanceStatus::Rebooting => "rebooting",
            InstanceStatus::ShutDown => "shut_down",
            InstanceStatus::BuildFailed => "build_failed",
            InstanceStatus::FailedToStart => "failed_to_start",
        }
    }

    /// A boot attempt is running.
    pub fn is_booting(&self) -> bool {
        match self {
            InstanceStatus::FetchingWorld
            | InstanceStatus::BuildingWorld
            | InstanceStatus::Booting
            | InstanceStatus::Restarting
            | InstanceStatus::RebuildingWorld
            | InstanceStatus::Rebooting => true,
            InstanceStatus::New
            | InstanceStatus::Started
            | InstanceStatus::ShutDown
            | InstanceStatus::BuildFailed
            | InstanceStatus::FailedToStart => false,
        }
    }

    /// The last boot attempt failed.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            InstanceStatus::BuildFailed | InstanceStatus::FailedToStart
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;

        if matches!(next, Restarting | ShutDown) {
            return true;
        }
        match self {
            New => matches!(next, FetchingWorld | BuildingWorld),
            FetchingWorld => matches!(next, BuildingWorld | BuildFailed),
            BuildingWorld => matches!(next, Booting | BuildFailed),
            Booting => matches!(next, Started | FailedToStart),
            Restarting => matches!(next, RebuildingWorld | BuildFailed),
            RebuildingWorld => matches!(next, Rebooting | BuildFailed),
            Rebooting => matches!(next, Started | FailedToStart),
            Started => matches!(next, FailedToStart),
            ShutDown | BuildFailed | FailedToStart => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
