// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker supervision - one subprocess and one reconnectable IPC channel per instance.

mod launcher;
mod pool;
mod process;

pub use launcher::*;
pub use pool::WorkerPool;
pub use process::*;

use thiserror::Error;

/// Errors from worker supervision.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// The worker executable could not be started.
    #[error("Worker spawn failed: {0}")]
    SpawnFailed(String),

    /// The worker was already destroyed.
    #[error("Worker already destroyed")]
    Destroyed,

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;
