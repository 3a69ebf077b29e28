// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key-value storage bridged to workers.
//!
//! Workers read and write persistent world state through KV ops on the
//! control channel. Keys are scoped by world id so instances of the same
//! world share state.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

/// Errors from a KV backend.
#[derive(Debug, Error)]
pub enum KvError {
    /// The backend rejected or failed the operation.
    #[error("backend error: {0}")]
    Backend(String),
}

/// World-scoped key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Look up `key` in `scope`.
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>, KvError>;

    /// Store `value` under `key` in `scope`.
    async fn set(&self, scope: &str, key: &str, value: Value) -> Result<(), KvError>;

    /// Remove `key` from `scope`. Missing keys are not an error.
    async fn delete(&self, scope: &str, key: &str) -> Result<(), KvError>;
}

/// In-process KV store.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<(String, String), Value>,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across all scopes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>, KvError> {
        Ok(self
            .entries
            .get(&(scope.to_string(), key.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn set(&self, scope: &str, key: &str, value: Value) -> Result<(), KvError> {
        self.entries
            .insert((scope.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, scope: &str, key: &str) -> Result<(), KvError> {
        self.entries.remove(&(scope.to_string(), key.to_string()));
        Ok(())
    }
}
