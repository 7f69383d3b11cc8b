//! Identification and dispatch
//!
//! Every config request, TFTP or HTTP, goes through [`Dispatcher::resolve`]:
//!
//! 0. answer from an installed package's `files/` when one holds the
//!    requested path; no device is identified or recorded for these
//! 1. extract a [`DeviceIdentifier`] from the raw request
//! 2. look up the device record, creating it on first sight
//! 3. keep the device's assigned plugin if it is still installed, otherwise
//!    match the identifier against every installed plugin, falling back to
//!    the autoprovisioning plugin on zero matches
//! 4. render (on the blocking pool, one render per device at a time)
//! 5. commit the device's new plugin/state, unless the requester is gone or
//!    the record changed underneath us

use crate::store::{DeviceStore, StoreError};
use bytes::Bytes;
use mayfly_common::{Device, DeviceIdentifier, DevicePatch, DeviceState, MacAddress};
use mayfly_plugins::{InstalledPlugin, PluginRegistry, RenderError, RenderParams, ASSET_CONTENT_TYPE};
use mayfly_tftp::{ErrorCode, FileResolver, ResolveError, SessionGuard, TftpRequest};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, error, info, warn, Level};

/// Why a request could not be answered
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Nothing in the request identifies a device
    #[error("request carries no device identity: {0}")]
    Unidentified(String),

    /// Path traversal and similar
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// No plugin claims the device and no autoprovisioning plugin is installed
    #[error("no plugin for {0}")]
    NoPlugin(String),

    /// More than one plugin claims the device
    #[error("{identifier} is claimed by several plugins: {}", plugins.join(", "))]
    Ambiguous {
        identifier: String,
        plugins: Vec<String>,
    },

    #[error("plugin {plugin} failed to render {identifier}: {source}")]
    Render {
        identifier: String,
        plugin: String,
        #[source]
        source: RenderError,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// TFTP error code and message sent to the device
    pub fn tftp_error(&self) -> (ErrorCode, String) {
        match self {
            DispatchError::Unidentified(_) | DispatchError::NoPlugin(_) => {
                (ErrorCode::FileNotFound, "file not found".to_string())
            }
            DispatchError::AccessDenied(_) => {
                (ErrorCode::AccessViolation, "access violation".to_string())
            }
            other => (ErrorCode::NotDefined, other.to_string()),
        }
    }

    /// Level a failed dispatch is logged at
    ///
    /// Unknown devices are routine. Refusals, render failures and plugin
    /// conflicts need an operator but are not daemon faults.
    pub fn log_level(&self) -> Level {
        match self {
            DispatchError::Unidentified(_) | DispatchError::NoPlugin(_) => Level::DEBUG,
            DispatchError::AccessDenied(_)
            | DispatchError::Ambiguous { .. }
            | DispatchError::Render { .. } => Level::WARN,
            DispatchError::Store(_) | DispatchError::Internal(_) => Level::ERROR,
        }
    }
}

impl From<DispatchError> for ResolveError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Unidentified(_) | DispatchError::NoPlugin(_) => {
                ResolveError::NotFound(err.to_string())
            }
            DispatchError::AccessDenied(_) => ResolveError::AccessDenied(err.to_string()),
            other => ResolveError::Failed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// The identifying parts of an HTTP request
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub path: String,
    pub query: BTreeMap<String, String>,
    /// `X-Mac-Address` header
    pub mac_header: Option<String>,
    pub user_agent: Option<String>,
}

/// A config request as it arrived on the wire
#[derive(Debug, Clone)]
pub enum RawRequest {
    Tftp { filename: String },
    Http(HttpRequest),
}

impl RawRequest {
    pub fn tftp(filename: impl Into<String>) -> Self {
        RawRequest::Tftp {
            filename: filename.into(),
        }
    }

    fn raw_path(&self) -> &str {
        match self {
            RawRequest::Tftp { filename } => filename,
            RawRequest::Http(http) => &http.path,
        }
    }
}

/// A successfully resolved request
#[derive(Debug, Clone)]
pub struct Resolution {
    /// `None` when a package file answered the request
    pub identifier: Option<DeviceIdentifier>,
    pub plugin: String,
    pub state: Option<DeviceState>,
    pub content: Bytes,
    pub content_type: String,
    /// Served from the config cache without rendering
    pub cached: bool,
}

/// Event emitted by the dispatcher
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// First time an identifier was seen
    DeviceDiscovered { identifier: DeviceIdentifier },
    Resolved {
        identifier: DeviceIdentifier,
        plugin: String,
        state: DeviceState,
        cached: bool,
    },
    Failed {
        identifier: Option<DeviceIdentifier>,
        error: String,
    },
}

/// Path the device asked for, with leading separators removed
fn requested_path(raw: &str) -> Result<String> {
    let cleaned = raw.trim_start_matches(['/', '\\']);
    if cleaned.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(DispatchError::AccessDenied(raw.to_string()));
    }
    Ok(cleaned.to_string())
}

/// Vendor/model token from a user agent, e.g. `Yealink SIP-T46S 66.86.0.15`
///
/// Takes up to two leading words, stopping at a bare version number or a
/// parenthesised comment; `/` separates words.
fn user_agent_token(user_agent: &str) -> Option<DeviceIdentifier> {
    let is_version = |word: &str| {
        word.contains('.') && word.chars().all(|c| c.is_ascii_digit() || c == '.')
    };
    let words: Vec<&str> = user_agent
        .split(|c: char| c.is_whitespace() || c == '/')
        .filter(|w| !w.is_empty())
        .take_while(|w| !w.starts_with('(') && !is_version(w))
        .take(2)
        .collect();
    DeviceIdentifier::token(&words.join(" ")).ok()
}

/// Turn a raw request into a device identifier and the requested path
pub fn extract_identifier(raw: &RawRequest) -> Result<(DeviceIdentifier, String)> {
    let requested = requested_path(raw.raw_path())?;

    let from_path = |path: &str| -> Result<DeviceIdentifier> {
        if let Some(mac) = MacAddress::find_in(path) {
            return Ok(DeviceIdentifier::Mac(mac));
        }
        DeviceIdentifier::filename(path).map_err(|_| DispatchError::Unidentified(path.to_string()))
    };

    let id = match raw {
        RawRequest::Tftp { .. } => from_path(&requested)?,
        RawRequest::Http(http) => {
            let explicit = http
                .query
                .get("mac")
                .and_then(|m| m.parse::<MacAddress>().ok())
                .or_else(|| http.mac_header.as_deref().and_then(|m| m.parse().ok()))
                .or_else(|| MacAddress::find_in(&requested))
                .or_else(|| http.user_agent.as_deref().and_then(MacAddress::find_in));

            match explicit {
                Some(mac) => DeviceIdentifier::Mac(mac),
                None => match http.user_agent.as_deref().and_then(user_agent_token) {
                    Some(token) => token,
                    None => from_path(&requested)?,
                },
            }
        }
    };

    Ok((id, requested))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheKey {
    plugin: String,
    version: Option<String>,
    generation: u64,
    revision: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    key: CacheKey,
    content: Bytes,
    content_type: String,
}

type LockMap = HashMap<DeviceIdentifier, Arc<tokio::sync::Mutex<()>>>;

/// One async lock per device, dropped from the map when nobody holds it
#[derive(Default)]
struct DeviceLocks {
    inner: Arc<Mutex<LockMap>>,
}

fn lock_map(map: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeviceLocks {
    async fn acquire(&self, id: &DeviceIdentifier) -> DeviceLockGuard {
        let mutex = lock_map(&self.inner).entry(id.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        DeviceLockGuard {
            locks: self.inner.clone(),
            id: id.clone(),
            _guard: guard,
        }
    }

    fn len(&self) -> usize {
        lock_map(&self.inner).len()
    }
}

struct DeviceLockGuard {
    locks: Arc<Mutex<LockMap>>,
    id: DeviceIdentifier,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for DeviceLockGuard {
    fn drop(&mut self) {
        let mut map = lock_map(&self.locks);
        // One reference in the map, one in our guard: no waiters
        if map.get(&self.id).is_some_and(|m| Arc::strong_count(m) <= 2) {
            map.remove(&self.id);
        }
    }
}

/// Ties requests to plugins, devices and rendered configs
pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
    store: Arc<dyn DeviceStore>,
    cache: Mutex<HashMap<DeviceIdentifier, CacheEntry>>,
    locks: DeviceLocks,
    event_sender: broadcast::Sender<DispatchEvent>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PluginRegistry>, store: Arc<dyn DeviceStore>) -> Self {
        let (event_sender, _) = broadcast::channel(1024);
        Self {
            registry,
            store,
            cache: Mutex::new(HashMap::new()),
            locks: DeviceLocks::default(),
            event_sender,
        }
    }

    /// Subscribe to dispatch events
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.event_sender.subscribe()
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn DeviceStore> {
        &self.store
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<DeviceIdentifier, CacheEntry>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop cached configs for one device, or for all of them
    pub fn invalidate(&self, id: Option<&DeviceIdentifier>) {
        let mut cache = self.cache();
        match id {
            Some(id) => {
                cache.remove(id);
            }
            None => cache.clear(),
        }
        debug!(device = ?id.map(|i| i.to_string()), "Config cache invalidated");
    }

    pub fn cached_devices(&self) -> usize {
        self.cache().len()
    }

    /// Resolve a request to a package file or a rendered config
    ///
    /// `guard` belongs to the requester; once it is revoked no device state
    /// is committed on its behalf.
    pub async fn resolve(&self, raw: &RawRequest, guard: Option<&SessionGuard>) -> Result<Resolution> {
        let asset = match requested_path(raw.raw_path()) {
            Ok(requested) => self.resolve_asset(requested).await,
            Err(e) => Err(e),
        };
        match asset {
            Ok(Some(resolution)) => return Ok(resolution),
            Ok(None) => {}
            Err(e) => {
                self.report_failure(None, &e);
                return Err(e);
            }
        }

        let (id, requested) = match extract_identifier(raw) {
            Ok(found) => found,
            Err(e) => {
                self.report_failure(None, &e);
                return Err(e);
            }
        };

        let result = self.resolve_identified(&id, requested, guard).await;
        match &result {
            Ok(resolution) => {
                debug!(
                    device = %id,
                    plugin = %resolution.plugin,
                    state = ?resolution.state,
                    cached = resolution.cached,
                    "Resolved config"
                );
                if let Some(state) = resolution.state {
                    let _ = self.event_sender.send(DispatchEvent::Resolved {
                        identifier: id.clone(),
                        plugin: resolution.plugin.clone(),
                        state,
                        cached: resolution.cached,
                    });
                }
            }
            Err(e) => self.report_failure(Some(&id), e),
        }
        result
    }

    async fn resolve_identified(
        &self,
        id: &DeviceIdentifier,
        requested: String,
        guard: Option<&SessionGuard>,
    ) -> Result<Resolution> {
        let _lock = self.locks.acquire(id).await;

        let device = self.load_or_create(id, guard).await?;
        let device = self.clear_stale_assignment(id, device, guard).await?;
        let generation = self.registry.generation();

        let (installed, state) = self.select_plugin(id, &device)?;

        let mut key = CacheKey {
            plugin: installed.id.clone(),
            version: installed.version.clone(),
            generation,
            revision: device.revision,
        };

        let cached = self
            .cache()
            .get(id)
            .filter(|entry| entry.key == key)
            .map(|entry| (entry.content.clone(), entry.content_type.clone()));

        let (content, content_type, was_cached) = match cached {
            Some((content, content_type)) => (content, content_type, true),
            None => {
                let params = RenderParams::new(requested).with_config(device.config.clone());
                let content = self.render(id, &installed, params).await?;
                (content, installed.plugin.content_type().to_string(), false)
            }
        };

        let device = self.commit(id, &device, &installed.id, state, guard).await?;

        key.revision = device.revision;
        self.cache().insert(
            id.clone(),
            CacheEntry {
                key,
                content: content.clone(),
                content_type: content_type.clone(),
            },
        );

        Ok(Resolution {
            identifier: Some(id.clone()),
            plugin: installed.id.clone(),
            state: Some(state),
            content,
            content_type,
            cached: was_cached,
        })
    }

    /// Serve a static file shipped in an installed package, if any holds `requested`
    async fn resolve_asset(&self, requested: String) -> Result<Option<Resolution>> {
        let registry = self.registry.clone();
        let found = tokio::task::spawn_blocking(move || {
            registry
                .find_asset(&requested)
                .map(|(installed, content)| (installed, content, requested))
        })
        .await
        .map_err(|e| DispatchError::Internal(format!("asset task failed: {}", e)))?;

        Ok(found.map(|(installed, content, requested)| {
            debug!(path = %requested, plugin = %installed.id, size = content.len(), "Serving package file");
            Resolution {
                identifier: None,
                plugin: installed.id.clone(),
                state: None,
                content,
                content_type: ASSET_CONTENT_TYPE.to_string(),
                cached: false,
            }
        }))
    }

    /// Match a request to a plugin and record the device as identified
    ///
    /// Nothing is rendered. Devices that only the autoprovisioning plugin
    /// would serve are left as they are.
    pub async fn identify(&self, raw: &RawRequest) -> Result<Device> {
        let (id, _) = extract_identifier(raw)?;
        let _lock = self.locks.acquire(&id).await;

        let device = self.load_or_create(&id, None).await?;
        let device = self.clear_stale_assignment(&id, device, None).await?;
        let (installed, state) = self.select_plugin(&id, &device)?;
        if state == DeviceState::Autoprov || device.plugin.as_deref() == Some(installed.id.as_str()) {
            return Ok(device);
        }

        let patch = DevicePatch::new()
            .with_plugin(Some(installed.id.clone()))
            .with_state(DeviceState::Identified)
            .expecting_revision(device.revision);
        let device = self.store.upsert(&id, patch).await?;
        info!(device = %id, plugin = %installed.id, "Device identified");
        Ok(device)
    }

    async fn load_or_create(&self, id: &DeviceIdentifier, guard: Option<&SessionGuard>) -> Result<Device> {
        if let Some(device) = self.store.get(id).await? {
            return Ok(device);
        }
        if guard.is_some_and(|g| !g.is_live()) {
            return Ok(Device::new(id.clone()));
        }

        match self.store.upsert(id, DevicePatch::new().expecting_revision(0)).await {
            Ok(device) => {
                debug!(device = %id, "New device");
                let _ = self.event_sender.send(DispatchEvent::DeviceDiscovered {
                    identifier: id.clone(),
                });
                Ok(device)
            }
            // Created by an administrative call in the meantime
            Err(StoreError::Conflict { .. }) => Ok(self
                .store
                .get(id)
                .await?
                .unwrap_or_else(|| Device::new(id.clone()))),
            Err(e) => Err(e.into()),
        }
    }

    /// Pick the plugin for a device
    ///
    /// A device assigned to an installed plugin keeps it; ambiguity only
    /// applies to unassigned devices.
    fn select_plugin(
        &self,
        id: &DeviceIdentifier,
        device: &Device,
    ) -> Result<(Arc<InstalledPlugin>, DeviceState)> {
        // Autoprov assignments are never sticky
        if device.state != DeviceState::Autoprov {
            if let Some(assigned) = device.plugin.as_deref() {
                if let Ok(installed) = self.registry.get(assigned) {
                    if self.registry.autoprov_id() != Some(assigned) {
                        return Ok((installed, DeviceState::Configured));
                    }
                }
            }
        }

        let mut matches = self.registry.matching(id);
        match matches.len() {
            1 => Ok((matches.remove(0), DeviceState::Configured)),
            0 => self
                .registry
                .autoprov()
                .map(|autoprov| (autoprov, DeviceState::Autoprov))
                .ok_or_else(|| DispatchError::NoPlugin(id.to_string())),
            _ => Err(DispatchError::Ambiguous {
                identifier: id.to_string(),
                plugins: matches.iter().map(|p| p.id.clone()).collect(),
            }),
        }
    }

    async fn render(
        &self,
        id: &DeviceIdentifier,
        installed: &Arc<InstalledPlugin>,
        params: RenderParams,
    ) -> Result<Bytes> {
        let plugin = installed.plugin.clone();
        let device = id.clone();
        let rendered = tokio::task::spawn_blocking(move || plugin.render(&device, &params))
            .await
            .map_err(|e| DispatchError::Internal(format!("render task failed: {}", e)))?;

        rendered.map_err(|source| DispatchError::Render {
            identifier: id.to_string(),
            plugin: installed.id.clone(),
            source,
        })
    }

    /// Persist the plugin and state a successful render implies
    async fn commit(
        &self,
        id: &DeviceIdentifier,
        device: &Device,
        plugin: &str,
        state: DeviceState,
        guard: Option<&SessionGuard>,
    ) -> Result<Device> {
        if device.plugin.as_deref() == Some(plugin) && device.state == state {
            return Ok(device.clone());
        }
        if guard.is_some_and(|g| !g.is_live()) {
            debug!(device = %id, "Requester gone, not committing device state");
            return Ok(device.clone());
        }

        let patch = DevicePatch::new()
            .with_plugin(Some(plugin.to_string()))
            .with_state(state)
            .expecting_revision(device.revision);
        match self.store.upsert(id, patch).await {
            Ok(committed) => {
                info!(device = %id, plugin = %plugin, state = %state, "Device updated");
                Ok(committed)
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(device = %id, "Device changed during render, not committing");
                Ok(device.clone())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop an assignment to a plugin that is no longer installed
    ///
    /// Runs before selection so that whatever follows (a new match, no
    /// match, ambiguity, a failed render) never leaves the device pointing
    /// at a missing plugin.
    async fn clear_stale_assignment(
        &self,
        id: &DeviceIdentifier,
        device: Device,
        guard: Option<&SessionGuard>,
    ) -> Result<Device> {
        let stale = device
            .plugin
            .as_deref()
            .is_some_and(|plugin| self.registry.get(plugin).is_err());
        if !stale || guard.is_some_and(|g| !g.is_live()) {
            return Ok(device);
        }

        let patch = DevicePatch::new()
            .with_plugin(None)
            .with_state(DeviceState::Unknown)
            .expecting_revision(device.revision);
        match self.store.upsert(id, patch).await {
            Ok(cleared) => {
                info!(device = %id, plugin = ?device.plugin, "Cleared assignment to uninstalled plugin");
                Ok(cleared)
            }
            Err(StoreError::Conflict { .. }) => Ok(self.store.get(id).await?.unwrap_or(device)),
            Err(e) => Err(e.into()),
        }
    }

    fn report_failure(&self, id: Option<&DeviceIdentifier>, err: &DispatchError) {
        let device = id.map(|i| i.to_string()).unwrap_or_default();
        let message = match err {
            DispatchError::Unidentified(_) | DispatchError::NoPlugin(_) => "No config for request",
            DispatchError::AccessDenied(_) => "Refused request",
            DispatchError::Render { .. } => "Render failed",
            DispatchError::Ambiguous { .. } => "Plugin conflict needs administrative correction",
            DispatchError::Store(_) | DispatchError::Internal(_) => "Dispatch failed",
        };
        match err.log_level() {
            Level::ERROR => error!(device = %device, error = %err, "{}", message),
            Level::WARN => warn!(device = %device, error = %err, "{}", message),
            _ => debug!(device = %device, error = %err, "{}", message),
        }
        let _ = self.event_sender.send(DispatchEvent::Failed {
            identifier: id.cloned(),
            error: err.to_string(),
        });
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("locked_devices", &self.locks.len())
            .finish_non_exhaustive()
    }
}

/// Serves TFTP reads through the dispatcher
///
/// Each resolution runs as its own task so that a session giving up does
/// not cancel a render half way; the revoked guard keeps it from committing.
#[derive(Debug, Clone)]
pub struct DispatchResolver {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchResolver {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait::async_trait]
impl FileResolver for DispatchResolver {
    async fn resolve(&self, request: &TftpRequest) -> std::result::Result<Bytes, ResolveError> {
        let dispatcher = self.dispatcher.clone();
        let raw = RawRequest::tftp(request.filename.clone());
        let guard = request.guard.clone();

        let task = tokio::spawn(async move { dispatcher.resolve(&raw, Some(&guard)).await });
        match task.await {
            Ok(Ok(resolution)) => Ok(resolution.content),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(ResolveError::Failed(format!("dispatch task failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use mayfly_plugins::{MatchRule, Plugin, PluginSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Compiled-in plugin that counts renders and can be told to fail
    struct CountingPlugin {
        rules: Vec<MatchRule>,
        prefix: String,
        body: String,
        renders: Arc<AtomicUsize>,
        fail: bool,
        delay: Duration,
    }

    impl CountingPlugin {
        fn new(prefix: &str, body: &str) -> Self {
            Self {
                rules: vec![MatchRule::MacPrefix {
                    prefix: prefix.to_string(),
                }],
                prefix: prefix.replace(':', ""),
                body: body.to_string(),
                renders: Arc::new(AtomicUsize::new(0)),
                fail: false,
                delay: Duration::ZERO,
            }
        }
    }

    impl Plugin for CountingPlugin {
        fn rules(&self) -> &[MatchRule] {
            &self.rules
        }

        fn matches(&self, id: &DeviceIdentifier) -> bool {
            id.as_mac()
                .is_some_and(|mac| mac.to_bare(false).starts_with(&self.prefix))
        }

        fn render(&self, id: &DeviceIdentifier, params: &RenderParams) -> std::result::Result<Bytes, RenderError> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(RenderError::Failed("boom".to_string()));
            }
            Ok(Bytes::from(format!("{} {} {}", self.body, id, params.requested)))
        }

        fn content_type(&self) -> &str {
            "text/plain"
        }
    }

    fn install(registry: &PluginRegistry, id: &str, plugin: CountingPlugin) -> Arc<AtomicUsize> {
        let renders = plugin.renders.clone();
        registry
            .install(id, Some("1.0"), PluginSource::Plugin(Arc::new(plugin)))
            .unwrap();
        renders
    }

    fn setup(registry: PluginRegistry) -> (Arc<Dispatcher>, Arc<dyn DeviceStore>) {
        let store: Arc<dyn DeviceStore> = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), store.clone()));
        (dispatcher, store)
    }

    fn mac_id() -> DeviceIdentifier {
        DeviceIdentifier::Mac("00:11:22:aa:bb:cc".parse().unwrap())
    }

    fn http(path: &str) -> HttpRequest {
        HttpRequest {
            path: path.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_extract_tftp_identifiers() {
        let (id, requested) = extract_identifier(&RawRequest::tftp("/SEP001122AABBCC.cnf.xml")).unwrap();
        assert_eq!(id, mac_id());
        assert_eq!(requested, "SEP001122AABBCC.cnf.xml");

        let (id, _) = extract_identifier(&RawRequest::tftp("\\Firmware\\SPA504G.cfg")).unwrap();
        assert_eq!(id, DeviceIdentifier::filename("firmware/spa504g.cfg").unwrap());

        assert!(matches!(
            extract_identifier(&RawRequest::tftp("../etc/passwd")),
            Err(DispatchError::AccessDenied(_))
        ));
        assert!(matches!(
            extract_identifier(&RawRequest::tftp("cfg/..\\..\\x")),
            Err(DispatchError::AccessDenied(_))
        ));
        assert!(matches!(
            extract_identifier(&RawRequest::tftp("/")),
            Err(DispatchError::Unidentified(_))
        ));
    }

    #[test]
    fn test_extract_http_identifier_precedence() {
        let mut request = http("/provisioning/001122aabbcc.cfg");
        request.query.insert("mac".to_string(), "00-11-22-dd-ee-ff".to_string());
        request.mac_header = Some("00:11:22:00:00:01".to_string());
        let (id, _) = extract_identifier(&RawRequest::Http(request.clone())).unwrap();
        assert_eq!(id.to_string(), "00:11:22:dd:ee:ff");

        request.query.clear();
        let (id, _) = extract_identifier(&RawRequest::Http(request.clone())).unwrap();
        assert_eq!(id.to_string(), "00:11:22:00:00:01");

        request.mac_header = Some("garbage".to_string());
        let (id, _) = extract_identifier(&RawRequest::Http(request)).unwrap();
        assert_eq!(id, mac_id());

        let mut request = http("/common.cfg");
        request.user_agent = Some("Yealink SIP-T46S 66.86.0.15 00:11:22:aa:bb:cc".to_string());
        let (id, _) = extract_identifier(&RawRequest::Http(request.clone())).unwrap();
        assert_eq!(id, mac_id());

        request.user_agent = Some("Yealink SIP-T46S 66.86.0.15".to_string());
        let (id, _) = extract_identifier(&RawRequest::Http(request.clone())).unwrap();
        assert_eq!(id.to_string(), "token:yealink sip-t46s");

        request.user_agent = None;
        let (id, requested) = extract_identifier(&RawRequest::Http(request)).unwrap();
        assert_eq!(id.to_string(), "file:common.cfg");
        assert_eq!(requested, "common.cfg");
    }

    #[test]
    fn test_user_agent_token() {
        assert_eq!(
            user_agent_token("Cisco/SPA504G-7.5.5").unwrap().to_string(),
            "token:cisco spa504g-7.5.5"
        );
        assert_eq!(
            user_agent_token("snom320 (compatible)").unwrap().to_string(),
            "token:snom320"
        );
        assert!(user_agent_token("1.2.3").is_none());
        assert!(user_agent_token("   ").is_none());
    }

    #[test]
    fn test_tftp_error_mapping() {
        assert_eq!(
            DispatchError::NoPlugin("x".to_string()).tftp_error().0,
            ErrorCode::FileNotFound
        );
        assert_eq!(
            DispatchError::AccessDenied("x".to_string()).tftp_error().0,
            ErrorCode::AccessViolation
        );
        let ambiguous = DispatchError::Ambiguous {
            identifier: "x".to_string(),
            plugins: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(ambiguous.tftp_error().0, ErrorCode::NotDefined);
        assert_eq!(ambiguous.to_string(), "x is claimed by several plugins: a, b");
        assert!(matches!(
            ResolveError::from(DispatchError::NoPlugin("x".to_string())),
            ResolveError::NotFound(_)
        ));
    }

    #[test]
    fn test_failure_log_levels() {
        let ambiguous = DispatchError::Ambiguous {
            identifier: "00:11:22:aa:bb:cc".to_string(),
            plugins: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(ambiguous.log_level(), Level::WARN);
        assert_eq!(DispatchError::NoPlugin("x".to_string()).log_level(), Level::DEBUG);
        assert_eq!(DispatchError::Unidentified("x".to_string()).log_level(), Level::DEBUG);
        assert_eq!(DispatchError::AccessDenied("x".to_string()).log_level(), Level::WARN);
        assert_eq!(
            DispatchError::Store(StoreError::Database("disk".to_string())).log_level(),
            Level::ERROR
        );
        assert_eq!(DispatchError::Internal("x".to_string()).log_level(), Level::ERROR);
    }

    #[tokio::test]
    async fn test_resolve_configures_device_and_is_idempotent() {
        let registry = PluginRegistry::new();
        let renders = install(&registry, "acme", CountingPlugin::new("00:11:22", "acme"));
        let (dispatcher, store) = setup(registry);
        let mut events = dispatcher.subscribe();

        let request = RawRequest::tftp("SEP001122AABBCC.cnf.xml");
        let first = dispatcher.resolve(&request, None).await.unwrap();
        assert_eq!(first.plugin, "acme");
        assert_eq!(first.state, Some(DeviceState::Configured));
        assert_eq!(first.content_type, "text/plain");
        assert!(!first.cached);

        let device = store.get(&mac_id()).await.unwrap().unwrap();
        assert_eq!(device.plugin.as_deref(), Some("acme"));
        assert_eq!(device.state, DeviceState::Configured);

        let second = dispatcher.resolve(&request, None).await.unwrap();
        assert_eq!(second.plugin, first.plugin);
        assert_eq!(second.content, first.content);
        assert!(second.cached);
        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&mac_id()).await.unwrap().unwrap().revision, device.revision);

        assert!(matches!(
            events.recv().await.unwrap(),
            DispatchEvent::DeviceDiscovered { .. }
        ));
        assert!(matches!(events.recv().await.unwrap(), DispatchEvent::Resolved { cached: false, .. }));
    }

    #[tokio::test]
    async fn test_invalidate_forces_render() {
        let registry = PluginRegistry::new();
        let renders = install(&registry, "acme", CountingPlugin::new("00:11:22", "acme"));
        let (dispatcher, _) = setup(registry);
        let request = RawRequest::tftp("001122aabbcc.cfg");

        dispatcher.resolve(&request, None).await.unwrap();
        dispatcher.resolve(&request, None).await.unwrap();
        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.cached_devices(), 1);

        dispatcher.invalidate(Some(&mac_id()));
        dispatcher.resolve(&request, None).await.unwrap();
        assert_eq!(renders.load(Ordering::SeqCst), 2);

        dispatcher.invalidate(None);
        assert_eq!(dispatcher.cached_devices(), 0);
    }

    #[tokio::test]
    async fn test_uninstall_then_not_found() {
        let registry = PluginRegistry::new();
        install(&registry, "a", CountingPlugin::new("00:11:22", "A"));
        let (dispatcher, store) = setup(registry);
        let request = RawRequest::tftp("001122aabbcc.cfg");

        let resolution = dispatcher.resolve(&request, None).await.unwrap();
        assert_eq!(resolution.plugin, "a");

        dispatcher.registry().uninstall("a").unwrap();
        let err = dispatcher.resolve(&request, None).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoPlugin(_)));

        // The stale assignment is gone
        let device = store.get(&mac_id()).await.unwrap().unwrap();
        assert!(device.plugin.is_none());
        assert_eq!(device.state, DeviceState::Unknown);
    }

    #[tokio::test]
    async fn test_stale_assignment_cleared_when_rematch_is_ambiguous() {
        let registry = PluginRegistry::new();
        install(&registry, "a", CountingPlugin::new("00:11:22", "A"));
        let (dispatcher, store) = setup(registry);
        let request = RawRequest::tftp("001122aabbcc.cfg");
        dispatcher.resolve(&request, None).await.unwrap();

        dispatcher.registry().uninstall("a").unwrap();
        install(dispatcher.registry(), "b", CountingPlugin::new("00:11", "B"));
        install(dispatcher.registry(), "c", CountingPlugin::new("00:11:22", "C"));

        let err = dispatcher.resolve(&request, None).await.unwrap_err();
        assert!(matches!(err, DispatchError::Ambiguous { .. }));

        let device = store.get(&mac_id()).await.unwrap().unwrap();
        assert!(device.plugin.is_none());
        assert_eq!(device.state, DeviceState::Unknown);
    }

    #[tokio::test]
    async fn test_stale_assignment_cleared_when_rematch_fails_to_render() {
        let registry = PluginRegistry::new();
        install(&registry, "a", CountingPlugin::new("00:11:22", "A"));
        let (dispatcher, store) = setup(registry);
        let request = RawRequest::tftp("001122aabbcc.cfg");
        dispatcher.resolve(&request, None).await.unwrap();

        dispatcher.registry().uninstall("a").unwrap();
        install(
            dispatcher.registry(),
            "broken",
            CountingPlugin {
                fail: true,
                ..CountingPlugin::new("00:11:22", "x")
            },
        );

        let err = dispatcher.resolve(&request, None).await.unwrap_err();
        assert!(matches!(err, DispatchError::Render { .. }));
        let device = store.get(&mac_id()).await.unwrap().unwrap();
        assert!(device.plugin.is_none());
    }

    #[tokio::test]
    async fn test_ambiguous_match_is_an_error() {
        let registry = PluginRegistry::new();
        install(&registry, "a", CountingPlugin::new("00:11", "A"));
        install(&registry, "b", CountingPlugin::new("00:11:22", "B"));
        let (dispatcher, store) = setup(registry);

        for _ in 0..3 {
            let err = dispatcher
                .resolve(&RawRequest::tftp("001122aabbcc.cfg"), None)
                .await
                .unwrap_err();
            match err {
                DispatchError::Ambiguous { plugins, .. } => assert_eq!(plugins, vec!["a", "b"]),
                other => panic!("expected ambiguity, got {:?}", other),
            }
        }
        // Seen, but never assigned
        let device = store.get(&mac_id()).await.unwrap().unwrap();
        assert!(device.plugin.is_none());
        assert_eq!(device.state, DeviceState::Unknown);
    }

    #[tokio::test]
    async fn test_autoprov_fallback_is_not_sticky() {
        let registry = PluginRegistry::new().with_autoprov("autoprov");
        registry
            .install(
                "autoprov",
                None,
                PluginSource::Plugin(Arc::new(CountingPlugin {
                    rules: Vec::new(),
                    ..CountingPlugin::new("", "boot")
                })),
            )
            .unwrap();
        let (dispatcher, store) = setup(registry);
        let request = RawRequest::tftp("001122aabbcc.cfg");

        let resolution = dispatcher.resolve(&request, None).await.unwrap();
        assert_eq!(resolution.plugin, "autoprov");
        assert_eq!(resolution.state, Some(DeviceState::Autoprov));
        assert_eq!(
            store.get(&mac_id()).await.unwrap().unwrap().state,
            DeviceState::Autoprov
        );

        // A matching plugin takes over on the next request
        install(dispatcher.registry(), "acme", CountingPlugin::new("00:11:22", "acme"));
        let resolution = dispatcher.resolve(&request, None).await.unwrap();
        assert_eq!(resolution.plugin, "acme");
        assert_eq!(resolution.state, Some(DeviceState::Configured));
    }

    #[tokio::test]
    async fn test_assigned_plugin_is_kept() {
        let registry = PluginRegistry::new();
        install(&registry, "a", CountingPlugin::new("00:11:22", "A"));
        let (dispatcher, _) = setup(registry);
        let request = RawRequest::tftp("001122aabbcc.cfg");
        dispatcher.resolve(&request, None).await.unwrap();

        // A second claimant does not make an assigned device ambiguous
        install(dispatcher.registry(), "b", CountingPlugin::new("00:11", "B"));
        let resolution = dispatcher.resolve(&request, None).await.unwrap();
        assert_eq!(resolution.plugin, "a");
    }

    #[tokio::test]
    async fn test_render_failure_leaves_state_unchanged() {
        let registry = PluginRegistry::new();
        install(
            &registry,
            "broken",
            CountingPlugin {
                fail: true,
                ..CountingPlugin::new("00:11:22", "x")
            },
        );
        let (dispatcher, store) = setup(registry);

        let err = dispatcher
            .resolve(&RawRequest::tftp("001122aabbcc.cfg"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Render { .. }));
        assert_eq!(err.tftp_error().0, ErrorCode::NotDefined);

        let device = store.get(&mac_id()).await.unwrap().unwrap();
        assert!(device.plugin.is_none());
        assert_eq!(device.state, DeviceState::Unknown);
        assert_eq!(dispatcher.cached_devices(), 0);
    }

    #[tokio::test]
    async fn test_revoked_guard_skips_commit() {
        let registry = PluginRegistry::new();
        install(&registry, "acme", CountingPlugin::new("00:11:22", "acme"));
        let (dispatcher, store) = setup(registry);

        let guard = SessionGuard::new();
        guard.revoke();
        let resolution = dispatcher
            .resolve(&RawRequest::tftp("001122aabbcc.cfg"), Some(&guard))
            .await
            .unwrap();
        assert_eq!(resolution.plugin, "acme");
        assert!(store.get(&mac_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renders_for_one_device_are_serialised() {
        let registry = PluginRegistry::new();
        let renders = install(
            &registry,
            "slow",
            CountingPlugin {
                delay: Duration::from_millis(100),
                ..CountingPlugin::new("00:11:22", "slow")
            },
        );
        let (dispatcher, _) = setup(registry);

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher
                        .resolve(&RawRequest::tftp("001122aabbcc.cfg"), None)
                        .await
                        .unwrap()
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        // The first render fills the cache for the ones queued behind it
        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_identify_records_plugin_without_rendering() {
        let registry = PluginRegistry::new();
        let renders = install(&registry, "acme", CountingPlugin::new("00:11:22", "acme"));
        let (dispatcher, _) = setup(registry);

        let device = dispatcher
            .identify(&RawRequest::tftp("001122aabbcc.cfg"))
            .await
            .unwrap();
        assert_eq!(device.state, DeviceState::Identified);
        assert_eq!(device.plugin.as_deref(), Some("acme"));
        assert_eq!(renders.load(Ordering::SeqCst), 0);

        let resolution = dispatcher
            .resolve(&RawRequest::tftp("001122aabbcc.cfg"), None)
            .await
            .unwrap();
        assert_eq!(resolution.state, Some(DeviceState::Configured));
    }

    #[tokio::test]
    async fn test_dispatch_resolver_maps_errors() {
        let (dispatcher, _) = setup(PluginRegistry::new());
        let resolver = DispatchResolver::new(dispatcher);
        let request = TftpRequest {
            filename: "001122aabbcc.cfg".to_string(),
            peer: "127.0.0.1:5000".parse().unwrap(),
            guard: SessionGuard::new(),
        };
        assert!(matches!(
            resolver.resolve(&request).await,
            Err(ResolveError::NotFound(_))
        ));
    }

    /// A static-content package on disk with the given `files/` entries
    fn package_with_files(id: &str, files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(mayfly_plugins::MANIFEST_FILE),
            format!(
                r#"{{"id": "{}", "entry_point": "static", "content": "rendered",
                    "rules": [{{"type": "mac_prefix", "prefix": "00:11:22"}}]}}"#,
                id
            ),
        )
        .unwrap();
        let root = dir.path().join(mayfly_plugins::ASSETS_DIR);
        std::fs::create_dir_all(root.join("firmware")).unwrap();
        for (name, body) in files {
            std::fs::write(root.join(name), body).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_package_file_served_without_device_record() {
        let package = package_with_files("acme", &[("firmware/acme-2.0.bin", "\x00FW")]);
        let registry = PluginRegistry::new();
        registry
            .install("acme", None, PluginSource::Directory(package.path().to_path_buf()))
            .unwrap();
        let (dispatcher, store) = setup(registry);
        let mut events = dispatcher.subscribe();

        let resolution = dispatcher
            .resolve(&RawRequest::tftp("/firmware/acme-2.0.bin"), None)
            .await
            .unwrap();
        assert_eq!(&resolution.content[..], b"\x00FW");
        assert_eq!(resolution.plugin, "acme");
        assert_eq!(resolution.content_type, ASSET_CONTENT_TYPE);
        assert!(resolution.identifier.is_none());
        assert!(resolution.state.is_none());
        assert!(store.list().await.unwrap().is_empty());
        assert!(events.try_recv().is_err());

        // Device configs still render through the plugin
        let resolution = dispatcher
            .resolve(&RawRequest::tftp("001122aabbcc.cfg"), None)
            .await
            .unwrap();
        assert_eq!(&resolution.content[..], b"rendered");
        assert_eq!(resolution.identifier, Some(mac_id()));
    }

    #[tokio::test]
    async fn test_package_files_are_not_listed_or_escaped() {
        let package = package_with_files("acme", &[("ring.wav", "RIFF")]);
        let registry = PluginRegistry::new();
        registry
            .install("acme", None, PluginSource::Directory(package.path().to_path_buf()))
            .unwrap();
        let (dispatcher, store) = setup(registry);

        assert!(matches!(
            dispatcher.resolve(&RawRequest::tftp("../plugin.json"), None).await,
            Err(DispatchError::AccessDenied(_))
        ));
        assert!(matches!(
            dispatcher.resolve(&RawRequest::tftp("plugin.json"), None).await,
            Err(DispatchError::NoPlugin(_))
        ));
        // A directory is neither listed nor mistaken for a file
        assert!(matches!(
            dispatcher.resolve(&RawRequest::Http(http("/firmware")), None).await,
            Err(DispatchError::NoPlugin(_))
        ));
        assert!(store.list().await.unwrap().iter().all(|d| d.plugin.is_none()));
    }

    #[tokio::test]
    async fn test_uninstalled_package_stops_serving_files() {
        let package = package_with_files("acme", &[("ring.wav", "RIFF")]);
        let registry = PluginRegistry::new();
        registry
            .install("acme", None, PluginSource::Directory(package.path().to_path_buf()))
            .unwrap();
        let (dispatcher, _) = setup(registry);

        let request = RawRequest::Http(http("/ring.wav"));
        assert_eq!(&dispatcher.resolve(&request, None).await.unwrap().content[..], b"RIFF");

        dispatcher.registry().uninstall("acme").unwrap();
        assert!(dispatcher.resolve(&request, None).await.is_err());
    }
}
