// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capability-token → worker lookup.
//!
//! The one structure shared across instances. A worker registers here
//! before its process starts so an early callback can always be matched.

use std::sync::Arc;

use dashmap::DashMap;

use super::WorkerProcess;

/// Live workers keyed by capability token.
#[derive(Default)]
pub struct WorkerPool {
    workers: DashMap<String, Arc<WorkerProcess>>,
}

impl WorkerPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` under its capability token.
    pub fn register(&self, worker: Arc<WorkerProcess>) {
        self.workers
            .insert(worker.capability_token().to_string(), worker);
    }

    /// Find the worker a transport callback belongs to.
    pub fn get(&self, token: &str) -> Option<Arc<WorkerProcess>> {
        self.workers.get(token).map(|entry| entry.value().clone())
    }

    /// Remove a worker's entry. Returns whether an entry existed.
    pub fn remove(&self, token: &str) -> bool {
        self.workers.remove(token).is_some()
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no workers are registered.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers belonging to `instance_id`.
    pub fn for_instance(&self, instance_id: &str) -> Vec<Arc<WorkerProcess>> {
        self.workers
            .iter()
            .filter(|entry| entry.value().instance_id() == instance_id)
            .map(|entry| entry.value().clone())
            .collect()
    }
}
