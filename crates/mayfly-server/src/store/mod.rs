//! Device storage backends
//!
//! This module provides the `DeviceStore` trait and two implementations:
//! - `MemoryStore` - In-memory storage for testing and throwaway daemons
//! - `RedbStore` - Local embedded database using ReDB

mod memory;
mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use async_trait::async_trait;
use mayfly_common::{Device, DeviceIdentifier, DevicePatch};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors from storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed
    #[error("revision conflict on {id}: expected {expected}, found {actual}")]
    Conflict { id: String, expected: u64, actual: u64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence for device records
///
/// Implementations must be safe to share between many concurrent
/// dispatches (`Arc<dyn DeviceStore>`).
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get(&self, id: &DeviceIdentifier) -> Result<Option<Device>>;

    /// Create the record if missing, apply the patch, and return the result
    ///
    /// A patch carrying an expected revision fails with
    /// [`StoreError::Conflict`] unless the stored revision (0 for a missing
    /// record) still matches.
    async fn upsert(&self, id: &DeviceIdentifier, patch: DevicePatch) -> Result<Device>;

    async fn delete(&self, id: &DeviceIdentifier) -> Result<()>;

    async fn list(&self) -> Result<Vec<Device>>;
}

/// Apply a patch to an optional existing record, enforcing the revision check
pub(crate) fn apply_patch(
    id: &DeviceIdentifier,
    existing: Option<Device>,
    patch: &DevicePatch,
) -> Result<Device> {
    let mut device = existing.unwrap_or_else(|| Device::new(id.clone()));
    if let Some(expected) = patch.expected_revision {
        if device.revision != expected {
            return Err(StoreError::Conflict {
                id: id.key(),
                expected,
                actual: device.revision,
            });
        }
    }
    device.apply(patch);
    Ok(device)
}

/// Storage configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StoreConfig {
    /// In-memory storage
    #[default]
    Memory,

    /// ReDB local database
    Redb { path: PathBuf },
}

/// Create a store from configuration
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn DeviceStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreConfig::Redb { path } => {
            let store = RedbStore::open(path)?;
            Ok(Arc::new(store))
        }
    }
}
