//! Mayfly plugin registry
//!
//! A plugin is a versioned package that knows how to recognise and configure
//! one family of devices. This crate defines the [`Plugin`] capability trait,
//! declarative [`MatchRule`]s, the manifest loader with its built-in
//! `template` and `static` renderers, static package files, plugin version
//! ordering, and the [`PluginRegistry`] that decides which plugins are
//! servable.

pub mod assets;
pub mod error;
pub mod loader;
pub mod matcher;
pub mod plugin;
pub mod registry;
pub mod version;

pub use assets::{PluginAssets, ASSETS_DIR, ASSET_CONTENT_TYPE};
pub use error::{PluginError, RenderError, Result};
pub use loader::{LoadedPlugin, PluginLoader, PluginManifest, PluginSource, MANIFEST_FILE};
pub use matcher::{MatchRule, Matcher};
pub use plugin::{Plugin, PluginInfo, RenderParams, DEFAULT_CONTENT_TYPE};
pub use registry::{InstalledPlugin, PluginRegistry};
pub use version::{compare_versions, version_less_than};
