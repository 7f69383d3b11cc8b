//! The authoritative set of installed plugins
//!
//! Mutations (`install`, `uninstall`, `upgrade`) are serialised by one
//! registry-wide lock that is held while the package loads, so they are
//! totally ordered. Readers take a short read lock and clone `Arc`s out;
//! a plugin handed to a dispatch keeps working after it is uninstalled or
//! replaced, but no later lookup returns it.

use crate::assets::PluginAssets;
use crate::error::{PluginError, Result};
use crate::loader::{PluginLoader, PluginSource};
use crate::plugin::{Plugin, PluginInfo};
use crate::version::version_less_than;
use bytes::Bytes;
use mayfly_common::DeviceIdentifier;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// A plugin as installed in the registry
pub struct InstalledPlugin {
    pub id: String,
    pub version: Option<String>,
    pub description: String,
    pub plugin: Arc<dyn Plugin>,
    pub assets: Option<PluginAssets>,
}

impl InstalledPlugin {
    /// A static file from the package's `files/` directory
    pub fn asset(&self, requested: &str) -> Option<Bytes> {
        self.assets.as_ref()?.read(requested)
    }

    pub fn info(&self, autoprov: bool) -> PluginInfo {
        PluginInfo {
            id: self.id.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            content_type: self.plugin.content_type().to_string(),
            rules: self.plugin.rules().to_vec(),
            autoprov,
        }
    }
}

impl std::fmt::Debug for InstalledPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstalledPlugin")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryState {
    plugins: BTreeMap<String, Arc<InstalledPlugin>>,
    generation: u64,
}

/// Plugin ids are used in paths and logs: keep them tame
fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PluginError::load(id, "invalid plugin id"))
    }
}

/// Installed plugins, keyed by plugin id
pub struct PluginRegistry {
    state: RwLock<RegistryState>,
    admin: Mutex<()>,
    loader: PluginLoader,
    autoprov_id: Option<String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            admin: Mutex::new(()),
            loader: PluginLoader::new(),
            autoprov_id: None,
        }
    }

    /// Designate the autoprovisioning plugin id
    ///
    /// That plugin need not declare match rules and never takes part in
    /// rule matching; it is only used as the zero-match fallback.
    pub fn with_autoprov(mut self, id: impl Into<String>) -> Self {
        self.autoprov_id = Some(id.into());
        self
    }

    pub fn autoprov_id(&self) -> Option<&str> {
        self.autoprov_id.as_deref()
    }

    fn is_autoprov(&self, id: &str) -> bool {
        self.autoprov_id.as_deref() == Some(id)
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load a package and make it eligible for dispatch
    pub fn install(&self, id: &str, version: Option<&str>, source: PluginSource) -> Result<PluginInfo> {
        let _admin = self.admin.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        validate_id(id)?;

        if self.read().plugins.contains_key(id) {
            return Err(PluginError::AlreadyInstalled(id.to_string()));
        }

        let installed = self.load(id, version, source)?;
        let info = installed.info(self.is_autoprov(id));

        let mut state = self.write();
        state.plugins.insert(id.to_string(), Arc::new(installed));
        state.generation += 1;
        info!(plugin = %id, version = ?version, generation = state.generation, "Plugin installed");

        Ok(info)
    }

    /// Remove a plugin; later lookups no longer see it
    pub fn uninstall(&self, id: &str) -> Result<()> {
        let _admin = self.admin.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut state = self.write();
        if state.plugins.remove(id).is_none() {
            return Err(PluginError::NotFound(id.to_string()));
        }
        state.generation += 1;
        info!(plugin = %id, generation = state.generation, "Plugin uninstalled");
        Ok(())
    }

    /// Atomically replace a plugin with a strictly newer version
    pub fn upgrade(&self, id: &str, version: Option<&str>, source: PluginSource) -> Result<PluginInfo> {
        let _admin = self.admin.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let current = self
            .read()
            .plugins
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        if !version_less_than(current.version.as_deref(), version) {
            return Err(PluginError::NotNewer {
                id: id.to_string(),
                installed: current.version.clone().unwrap_or_default(),
                requested: version.unwrap_or_default().to_string(),
            });
        }

        let installed = self.load(id, version, source)?;
        let info = installed.info(self.is_autoprov(id));

        let mut state = self.write();
        state.plugins.insert(id.to_string(), Arc::new(installed));
        state.generation += 1;
        info!(
            plugin = %id,
            from = ?current.version,
            to = ?version,
            generation = state.generation,
            "Plugin upgraded"
        );

        Ok(info)
    }

    fn load(&self, id: &str, version: Option<&str>, source: PluginSource) -> Result<InstalledPlugin> {
        debug!(plugin = %id, source = ?source, "Loading plugin");
        let loaded = self.loader.load(id, source)?;

        if !self.is_autoprov(id) && loaded.plugin.rules().is_empty() {
            return Err(PluginError::load(id, "plugin declares no match rules"));
        }

        Ok(InstalledPlugin {
            id: id.to_string(),
            version: version.map(str::to_string),
            description: loaded.description,
            plugin: loaded.plugin,
            assets: loaded.assets,
        })
    }

    pub fn get(&self, id: &str) -> Result<Arc<InstalledPlugin>> {
        self.read()
            .plugins
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        self.read()
            .plugins
            .values()
            .map(|p| p.info(self.is_autoprov(&p.id)))
            .collect()
    }

    /// Incremented on every install, uninstall and upgrade
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// Every non-autoprov plugin whose rules claim the identifier
    pub fn matching(&self, id: &DeviceIdentifier) -> Vec<Arc<InstalledPlugin>> {
        self.read()
            .plugins
            .values()
            .filter(|p| !self.is_autoprov(&p.id) && p.plugin.matches(id))
            .cloned()
            .collect()
    }

    /// The first installed plugin, in id order, whose `files/` holds `requested`
    ///
    /// Reads the file system; call it off the async runtime.
    pub fn find_asset(&self, requested: &str) -> Option<(Arc<InstalledPlugin>, Bytes)> {
        let candidates: Vec<_> = self
            .read()
            .plugins
            .values()
            .filter(|p| p.assets.is_some())
            .cloned()
            .collect();
        candidates
            .into_iter()
            .find_map(|p| p.asset(requested).map(|content| (p, content)))
    }

    /// The autoprovisioning plugin, if designated and installed
    pub fn autoprov(&self) -> Option<Arc<InstalledPlugin>> {
        let id = self.autoprov_id.as_deref()?;
        self.read().plugins.get(id).cloned()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("autoprov_id", &self.autoprov_id)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}
