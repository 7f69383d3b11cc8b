//! In-memory storage backend
//!
//! Simple storage for testing and development.

use super::{apply_patch, DeviceStore, Result, StoreError};
use async_trait::async_trait;
use mayfly_common::{Device, DeviceIdentifier, DevicePatch};
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory storage backend
pub struct MemoryStore {
    devices: RwLock<HashMap<DeviceIdentifier, Device>>,
}

impl MemoryStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn get(&self, id: &DeviceIdentifier) -> Result<Option<Device>> {
        let guard = self.devices.read().map_err(|e| {
            StoreError::Database(format!("lock poisoned: {}", e))
        })?;
        Ok(guard.get(id).cloned())
    }

    async fn upsert(&self, id: &DeviceIdentifier, patch: DevicePatch) -> Result<Device> {
        let mut guard = self.devices.write().map_err(|e| {
            StoreError::Database(format!("lock poisoned: {}", e))
        })?;
        let device = apply_patch(id, guard.get(id).cloned(), &patch)?;
        guard.insert(id.clone(), device.clone());
        Ok(device)
    }

    async fn delete(&self, id: &DeviceIdentifier) -> Result<()> {
        let mut guard = self.devices.write().map_err(|e| {
            StoreError::Database(format!("lock poisoned: {}", e))
        })?;
        guard
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.key()))
    }

    async fn list(&self) -> Result<Vec<Device>> {
        let guard = self.devices.read().map_err(|e| {
            StoreError::Database(format!("lock poisoned: {}", e))
        })?;
        let mut devices: Vec<Device> = guard.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }
}
