// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide instance id → [`Instance`] map.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::instance::{CreateInstance, HostServices, Instance, InstanceInfo};

/// Every live instance of this host.
pub struct InstanceRegistry {
    instances: DashMap<String, Arc<Instance>>,
    services: Arc<HostServices>,
}

impl InstanceRegistry {
    /// Create an empty registry whose instances share `services`.
    pub fn new(services: Arc<HostServices>) -> Self {
        Self {
            instances: DashMap::new(),
            services,
        }
    }

    /// Register a new instance in `New` status. Booting is left to the caller
    /// (or to the first player connect).
    pub fn create(&self, request: CreateInstance) -> Arc<Instance> {
        let id = uuid::Uuid::new_v4().to_string();
        let instance = Instance::new(InstanceInfo::new(id.clone(), request), self.services.clone());
        self.instances.insert(id.clone(), instance.clone());
        info!(
            instance_id = %id,
            world_id = %instance.info().world.world_id,
            variant = %instance.info().world.variant,
            "Instance created"
        );
        instance
    }

    /// Look up an instance.
    pub fn get(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.get(id).map(|entry| entry.value().clone())
    }

    /// Remove an instance and retire it, returning it. Does not shut it down.
    pub fn remove(&self, id: &str) -> Option<Arc<Instance>> {
        let (_, instance) = self.instances.remove(id)?;
        instance.retire();
        Some(instance)
    }

    /// Snapshot of every registered instance.
    pub fn list(&self) -> Vec<Arc<Instance>> {
        self.instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether no instances are registered.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Shared collaborators.
    pub fn services(&self) -> &Arc<HostServices> {
        &self.services
    }

    /// Remove and shut down every instance.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some(instance) = self.remove(&id) {
                instance.shutdown().await;
            }
        }
    }
}
