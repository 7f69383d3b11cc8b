//! Administrative facade
//!
//! The operations an operator (or a REST layer in front of the daemon)
//! performs on plugins and devices. Plugin changes go through the registry;
//! anything that would leave device records or cached configs pointing at
//! stale content is cleaned up here.

use crate::dispatch::Dispatcher;
use crate::store::StoreError;
use mayfly_common::{Device, DeviceConfig, DeviceIdentifier, DevicePatch, DeviceState};
use mayfly_plugins::{PluginError, PluginInfo, PluginManifest, PluginSource, MANIFEST_FILE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cannot read plugin directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, AdminError>;

/// Outcome of loading one package during a bulk install
#[derive(Debug)]
pub struct PackageReport {
    pub path: PathBuf,
    pub result: std::result::Result<PluginInfo, PluginError>,
}

#[derive(Debug, Clone)]
pub struct AdminService {
    dispatcher: Arc<Dispatcher>,
}

impl AdminService {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    fn is_autoprov(&self, id: &str) -> bool {
        self.dispatcher.registry().autoprov_id() == Some(id)
    }

    pub fn install_plugin(&self, id: &str, version: Option<&str>, source: PluginSource) -> Result<PluginInfo> {
        Ok(self.dispatcher.registry().install(id, version, source)?)
    }

    /// Remove a plugin and release the devices assigned to it
    pub async fn uninstall_plugin(&self, id: &str) -> Result<usize> {
        self.dispatcher.registry().uninstall(id)?;

        let mut released = 0;
        for device in self.dispatcher.store().list().await? {
            if device.plugin.as_deref() != Some(id) {
                continue;
            }
            let patch = DevicePatch::new()
                .with_plugin(None)
                .with_state(DeviceState::Unknown)
                .expecting_revision(device.revision);
            match self.dispatcher.store().upsert(&device.id, patch).await {
                Ok(_) => released += 1,
                // Already re-resolved by a concurrent request
                Err(StoreError::Conflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            self.dispatcher.invalidate(Some(&device.id));
        }

        info!(plugin = %id, devices = released, "Released devices of uninstalled plugin");
        Ok(released)
    }

    pub fn upgrade_plugin(&self, id: &str, version: Option<&str>, source: PluginSource) -> Result<PluginInfo> {
        Ok(self.dispatcher.registry().upgrade(id, version, source)?)
    }

    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        self.dispatcher.registry().list()
    }

    pub fn get_plugin(&self, id: &str) -> Result<PluginInfo> {
        let installed = self.dispatcher.registry().get(id)?;
        Ok(installed.info(self.is_autoprov(id)))
    }

    /// Install every package directory below `dir`
    ///
    /// One broken package does not stop the others; each gets a report.
    pub fn install_directory(&self, dir: &Path) -> Result<Vec<PackageReport>> {
        let io_error = |source| AdminError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut packages = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_error)? {
            let path = entry.map_err(io_error)?.path();
            if path.join(MANIFEST_FILE).is_file() {
                packages.push(path);
            }
        }
        packages.sort();

        let reports: Vec<PackageReport> = packages
            .into_iter()
            .map(|path| {
                let result = PluginManifest::read(&path).and_then(|manifest| {
                    self.dispatcher.registry().install(
                        &manifest.id,
                        manifest.version.as_deref(),
                        PluginSource::Directory(path.clone()),
                    )
                });
                if let Err(e) = &result {
                    warn!(path = %path.display(), error = %e, "Failed to load plugin package");
                }
                PackageReport { path, result }
            })
            .collect();

        info!(
            dir = %dir.display(),
            loaded = reports.iter().filter(|r| r.result.is_ok()).count(),
            failed = reports.iter().filter(|r| r.result.is_err()).count(),
            "Plugin directory processed"
        );
        Ok(reports)
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.dispatcher.store().list().await?)
    }

    pub async fn get_device(&self, id: &DeviceIdentifier) -> Result<Device> {
        self.dispatcher
            .store()
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.key()).into())
    }

    /// Replace a device's per-device render overrides
    pub async fn set_device_config(&self, id: &DeviceIdentifier, config: DeviceConfig) -> Result<Device> {
        let device = self
            .dispatcher
            .store()
            .upsert(id, DevicePatch::new().with_config(config))
            .await?;
        self.dispatcher.invalidate(Some(id));
        Ok(device)
    }

    pub async fn delete_device(&self, id: &DeviceIdentifier) -> Result<()> {
        self.dispatcher.store().delete(id).await?;
        self.dispatcher.invalidate(Some(id));
        info!(device = %id, "Device deleted");
        Ok(())
    }

    /// Drop cached configs for one device, or for every device
    pub fn invalidate(&self, id: Option<&DeviceIdentifier>) {
        self.dispatcher.invalidate(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RawRequest;
    use crate::store::{DeviceStore, MemoryStore};
    use mayfly_plugins::PluginRegistry;

    fn admin() -> AdminService {
        let store: Arc<dyn DeviceStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(PluginRegistry::new().with_autoprov("autoprov"));
        AdminService::new(Arc::new(Dispatcher::new(registry, store)))
    }

    fn write_package(root: &Path, dir: &str, manifest: serde_json::Value) {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(MANIFEST_FILE), manifest.to_string()).unwrap();
    }

    fn static_manifest(id: &str, prefix: &str, content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "version": "1.0",
            "entry_point": "static",
            "rules": [{ "type": "mac_prefix", "prefix": prefix }],
            "content": content,
        })
    }

    fn source(id: &str, prefix: &str, content: &str) -> PluginSource {
        PluginSource::Manifest(serde_json::from_value(static_manifest(id, prefix, content)).unwrap())
    }

    #[tokio::test]
    async fn test_uninstall_releases_devices() {
        let admin = admin();
        admin.install_plugin("acme", Some("1.0"), source("acme", "00:11:22", "A")).unwrap();

        let raw = RawRequest::tftp("001122aabbcc.cfg");
        admin.dispatcher.resolve(&raw, None).await.unwrap();
        let id: DeviceIdentifier = "00:11:22:aa:bb:cc".parse().unwrap();
        assert_eq!(admin.get_device(&id).await.unwrap().plugin.as_deref(), Some("acme"));

        assert_eq!(admin.uninstall_plugin("acme").await.unwrap(), 1);
        let device = admin.get_device(&id).await.unwrap();
        assert!(device.plugin.is_none());
        assert_eq!(device.state, DeviceState::Unknown);

        assert!(matches!(
            admin.uninstall_plugin("acme").await,
            Err(AdminError::Plugin(PluginError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_device_config_overrides_invalidate_cache() {
        let admin = admin();
        admin
            .install_plugin(
                "acme",
                None,
                PluginSource::Manifest(
                    serde_json::from_value(serde_json::json!({
                        "id": "acme",
                        "entry_point": "template",
                        "rules": [{ "type": "mac_any" }],
                        "template": "line={{ config.line }}",
                        "defaults": { "line": "100" },
                    }))
                    .unwrap(),
                ),
            )
            .unwrap();

        let raw = RawRequest::tftp("001122aabbcc.cfg");
        let first = admin.dispatcher.resolve(&raw, None).await.unwrap();
        assert_eq!(&first.content[..], b"line=100");

        let id: DeviceIdentifier = "00:11:22:aa:bb:cc".parse().unwrap();
        let mut config = DeviceConfig::new();
        config.insert("line".to_string(), serde_json::json!("205"));
        admin.set_device_config(&id, config).await.unwrap();

        let second = admin.dispatcher.resolve(&raw, None).await.unwrap();
        assert_eq!(&second.content[..], b"line=205");
        assert!(!second.cached);
    }

    #[tokio::test]
    async fn test_device_admin() {
        let admin = admin();
        let id: DeviceIdentifier = "00:11:22:aa:bb:cc".parse().unwrap();
        assert!(matches!(
            admin.get_device(&id).await,
            Err(AdminError::Store(StoreError::NotFound(_)))
        ));

        // Unclaimed devices are still recorded
        let _ = admin.dispatcher.resolve(&RawRequest::tftp("001122aabbcc.cfg"), None).await;
        assert_eq!(admin.list_devices().await.unwrap().len(), 1);

        admin.delete_device(&id).await.unwrap();
        assert!(admin.list_devices().await.unwrap().is_empty());
    }

    #[test]
    fn test_install_directory_reports_each_package() {
        let tmp = tempfile::tempdir().unwrap();
        write_package(tmp.path(), "acme", static_manifest("acme", "00:11:22", "A"));
        write_package(tmp.path(), "bogus", serde_json::json!({ "id": "bogus", "entry_point": "wasm" }));
        std::fs::write(tmp.path().join("README"), "not a package").unwrap();

        let admin = admin();
        let reports = admin.install_directory(tmp.path()).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].result.is_ok());
        assert!(matches!(reports[1].result, Err(PluginError::Load { .. })));

        let info = admin.get_plugin("acme").unwrap();
        assert_eq!(info.version.as_deref(), Some("1.0"));
        assert!(!info.autoprov);
        assert_eq!(admin.list_plugins().len(), 1);

        assert!(matches!(
            admin.install_directory(&tmp.path().join("missing")),
            Err(AdminError::Io { .. })
        ));
    }

    #[test]
    fn test_upgrade_plugin() {
        let admin = admin();
        admin.install_plugin("acme", Some("1.0"), source("acme", "00:11:22", "A")).unwrap();
        assert!(matches!(
            admin.upgrade_plugin("acme", Some("0.9"), source("acme", "00:11:22", "B")),
            Err(AdminError::Plugin(PluginError::NotNewer { .. }))
        ));
        let info = admin
            .upgrade_plugin("acme", Some("1.1"), source("acme", "00:11:22", "B"))
            .unwrap();
        assert_eq!(info.version.as_deref(), Some("1.1"));
    }
}
