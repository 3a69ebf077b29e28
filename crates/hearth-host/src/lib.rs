// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hearth Host - control plane for multiplayer game instances
//!
//! Authenticates player sockets, provisions one sandboxed worker process per
//! game session ("instance") and relays typed packets between many players
//! and that one worker.
//!
//! # Architecture
//!
//! ```text
//!   players (WebSocket)                    worker subprocess (WebSocket back)
//!        │  /instances/{id}/connect                 │  /internal/worker
//!        ▼                                          ▼
//! ┌──────────────────┐  IncomingPacket  ┌──────────────────┐  capability
//! │ ConnectionManager│ ───────────────► │  WorkerProcess   │◄─ token ── WorkerPool
//! │  (fan-out relay) │ ◄─────────────── │ (supervisor+bus) │
//! └──────────────────┘  OutgoingPacket  └──────────────────┘
//!          ▲                                    ▲
//!          └────────────── Instance ────────────┘
//!                  (lifecycle state machine)
//!                            ▲
//!               InstanceRegistry ◄── Reaper (idle scan)
//! ```
//!
//! # Instance lifecycle
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `new` | Created, never booted |
//! | `fetching_world` / `building_world` / `booting` | First boot in progress |
//! | `restarting` / `rebuilding_world` / `rebooting` | Restart in progress |
//! | `started` | Worker up, relaying |
//! | `build_failed` / `failed_to_start` | Last attempt failed; detail recorded |
//! | `shut_down` | Stopped; a player connect revives it |
//!
//! # Configuration
//!
//! See [`config::Config`] for the environment variables read by the binary.
//! Embedders use [`runtime::HostRuntime::builder`].

#![warn(missing_docs)]

pub mod auth;
pub mod config;
pub mod connections;
pub mod error;
pub mod handlers;
pub mod instance;
pub mod kv;
pub mod provision;
pub mod reaper;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod supervisor;
pub mod transport;

pub use error::{ConnectError, Error, Result};
