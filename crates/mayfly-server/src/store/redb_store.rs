//! ReDB storage backend
//!
//! Local embedded database for standalone deployments. Records are stored
//! as JSON under their identifier key. Every transaction runs on the
//! blocking pool so commits never stall the runtime's timers.

use super::{apply_patch, DeviceStore, Result, StoreError};
use async_trait::async_trait;
use mayfly_common::{Device, DeviceIdentifier, DevicePatch};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

const DEVICE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");

/// Wrap a redb error with what we were doing
fn db<E: Display>(context: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::Database(format!("{}: {}", context, e))
}

fn decode(bytes: &[u8]) -> Result<Device> {
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Serialization(format!("failed to deserialize device: {}", e)))
}

fn encode(device: &Device) -> Result<Vec<u8>> {
    serde_json::to_vec(device)
        .map_err(|e| StoreError::Serialization(format!("failed to serialize device: {}", e)))
}

/// ReDB storage backend
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a ReDB database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let database = Database::create(path).map_err(db("failed to open database"))?;

        let txn = database.begin_write().map_err(db("failed to begin transaction"))?;
        txn.open_table(DEVICE_TABLE)
            .map_err(db("failed to create devices table"))?;
        txn.commit().map_err(db("failed to commit"))?;

        Ok(Self {
            db: Arc::new(database),
        })
    }

    /// Run a database closure on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let database = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&database))
            .await
            .map_err(db("store task failed"))?
    }
}

#[async_trait]
impl DeviceStore for RedbStore {
    async fn get(&self, id: &DeviceIdentifier) -> Result<Option<Device>> {
        let key = id.key();
        self.blocking(move |database| {
            let txn = database.begin_read().map_err(db("failed to begin read"))?;
            let table = txn.open_table(DEVICE_TABLE).map_err(db("failed to open table"))?;

            let value = table.get(key.as_str()).map_err(db("get failed"))?;
            value.map(|value| decode(value.value())).transpose()
        })
        .await
    }

    async fn upsert(&self, id: &DeviceIdentifier, patch: DevicePatch) -> Result<Device> {
        let id = id.clone();
        self.blocking(move |database| {
            let key = id.key();

            // Read, check and write in one transaction so the revision check holds
            let txn = database.begin_write().map_err(db("failed to begin write"))?;
            let device = {
                let mut table = txn.open_table(DEVICE_TABLE).map_err(db("failed to open table"))?;
                let existing = table
                    .get(key.as_str())
                    .map_err(db("get failed"))?
                    .map(|value| decode(value.value()))
                    .transpose()?;

                let device = apply_patch(&id, existing, &patch)?;
                table
                    .insert(key.as_str(), encode(&device)?.as_slice())
                    .map_err(db("insert failed"))?;
                device
            };
            txn.commit().map_err(db("commit failed"))?;

            Ok(device)
        })
        .await
    }

    async fn delete(&self, id: &DeviceIdentifier) -> Result<()> {
        let key = id.key();
        self.blocking(move |database| {
            let txn = database.begin_write().map_err(db("failed to begin write"))?;

            let removed = txn
                .open_table(DEVICE_TABLE)
                .map_err(db("failed to open table"))?
                .remove(key.as_str())
                .map_err(db("remove failed"))?
                .is_some();

            if !removed {
                let _ = txn.abort();
                return Err(StoreError::NotFound(key));
            }
            txn.commit().map_err(db("commit failed"))?;
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Device>> {
        self.blocking(|database| {
            let txn = database.begin_read().map_err(db("failed to begin read"))?;
            let table = txn.open_table(DEVICE_TABLE).map_err(db("failed to open table"))?;

            let mut devices = table
                .iter()
                .map_err(db("iter failed"))?
                .map(|entry| {
                    let (_, value) = entry.map_err(db("entry read failed"))?;
                    decode(value.value())
                })
                .collect::<Result<Vec<_>>>()?;
            devices.sort_by(|a, b| a.id.cmp(&b.id));

            Ok(devices)
        })
        .await
    }
}
