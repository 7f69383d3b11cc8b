//! The capability contract every plugin satisfies

use crate::error::RenderError;
use crate::matcher::MatchRule;
use bytes::Bytes;
use mayfly_common::{DeviceConfig, DeviceIdentifier};
use serde::Serialize;

/// Content type used when a plugin does not declare one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Inputs to a render beyond the device identifier
#[derive(Debug, Clone, Default)]
pub struct RenderParams {
    /// Path or filename the device asked for, already normalised
    pub requested: String,

    /// Per-device overrides from the device store
    pub config: DeviceConfig,
}

impl RenderParams {
    pub fn new(requested: impl Into<String>) -> Self {
        Self {
            requested: requested.into(),
            config: DeviceConfig::new(),
        }
    }

    pub fn with_config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }
}

/// A device-family package as seen by the dispatch engine
///
/// Rendering is synchronous; callers move it off the async runtime.
pub trait Plugin: Send + Sync {
    /// Declared rules, used for validation and listings
    fn rules(&self) -> &[MatchRule];

    /// Does this plugin claim the identifier?
    fn matches(&self, id: &DeviceIdentifier) -> bool;

    /// Produce the configuration file for a device
    fn render(&self, id: &DeviceIdentifier, params: &RenderParams) -> Result<Bytes, RenderError>;

    fn content_type(&self) -> &str {
        DEFAULT_CONTENT_TYPE
    }
}

/// Serializable summary of an installed plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub id: String,
    pub version: Option<String>,
    pub description: String,
    pub content_type: String,
    pub rules: Vec<MatchRule>,
    pub autoprov: bool,
}
