//! The Device record - what the daemon remembers about a phone between requests.

use crate::identifier::DeviceIdentifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque per-device configuration overrides handed to the renderer
pub type DeviceConfig = BTreeMap<String, serde_json::Value>;

/// Provisioning lifecycle of a device
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// Seen on the wire, no plugin claims it yet
    #[default]
    Unknown,
    /// Exactly one plugin claims it, nothing rendered yet
    Identified,
    /// Its plugin rendered a configuration for it
    Configured,
    /// Served by the autoprovisioning plugin
    Autoprov,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Unknown => "unknown",
            DeviceState::Identified => "identified",
            DeviceState::Configured => "configured",
            DeviceState::Autoprov => "autoprov",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device known to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    /// Primary key
    pub id: DeviceIdentifier,

    /// Plugin currently assigned to the device, if any
    pub plugin: Option<String>,

    pub state: DeviceState,

    /// Per-device overrides merged over the plugin defaults at render time
    #[serde(default)]
    pub config: DeviceConfig,

    /// Bumped on every committed change
    pub revision: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// A freshly observed device with no plugin
    pub fn new(id: DeviceIdentifier) -> Self {
        let now = Utc::now();
        Self {
            id,
            plugin: None,
            state: DeviceState::Unknown,
            config: DeviceConfig::new(),
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a patch in place and bump the revision
    pub fn apply(&mut self, patch: &DevicePatch) {
        if let Some(plugin) = &patch.plugin {
            self.plugin = plugin.clone();
        }
        if let Some(state) = patch.state {
            self.state = state;
        }
        if let Some(config) = &patch.config {
            self.config = config.clone();
        }
        self.revision += 1;
        self.updated_at = Utc::now();
    }
}

/// Partial update for a device record
///
/// `None` leaves a field untouched. `plugin: Some(None)` clears the plugin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevicePatch {
    pub plugin: Option<Option<String>>,
    pub state: Option<DeviceState>,
    pub config: Option<DeviceConfig>,

    /// Only commit if the stored revision still equals this value
    pub expected_revision: Option<u64>,
}

impl DevicePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin(mut self, plugin: Option<String>) -> Self {
        self.plugin = Some(plugin);
        self
    }

    pub fn with_state(mut self, state: DeviceState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_config(mut self, config: DeviceConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn expecting_revision(mut self, revision: u64) -> Self {
        self.expected_revision = Some(revision);
        self
    }
}
