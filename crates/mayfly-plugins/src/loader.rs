//! Turning plugin packages into [`Plugin`] implementations
//!
//! A package is a directory holding a `plugin.json` manifest, the template
//! it points at for template plugins, and optionally a `files/` directory
//! of static assets. The manifest's
//! `entry_point` selects one of the built-in renderers:
//!
//! - `template`: a minijinja template rendered per device
//! - `static`: the same bytes for every device
//!
//! Compiled-in plugins skip all of this and are installed directly as
//! [`PluginSource::Plugin`].

use crate::assets::PluginAssets;
use crate::error::{PluginError, RenderError, Result};
use crate::matcher::{MatchRule, Matcher};
use crate::plugin::{Plugin, RenderParams, DEFAULT_CONTENT_TYPE};
use bytes::Bytes;
use mayfly_common::{DeviceConfig, DeviceIdentifier};
use minijinja::{context, Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Manifest file name inside a plugin package
pub const MANIFEST_FILE: &str = "plugin.json";

const TEMPLATE_NAME: &str = "config";

/// Contents of `plugin.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub description: String,

    /// `template` or `static`
    pub entry_point: String,

    #[serde(default)]
    pub content_type: Option<String>,

    #[serde(default)]
    pub rules: Vec<MatchRule>,

    /// Inline template source
    #[serde(default)]
    pub template: Option<String>,

    /// Template file, relative to the package directory
    #[serde(default)]
    pub template_file: Option<String>,

    /// Body served by `static` plugins
    #[serde(default)]
    pub content: Option<String>,

    /// Values merged under each device's own config at render time
    #[serde(default)]
    pub defaults: DeviceConfig,
}

impl PluginManifest {
    /// Read `plugin.json` from a package directory
    pub fn read(dir: &Path) -> Result<Self> {
        let label = dir.display().to_string();
        let path = dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| PluginError::load(&label, format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| PluginError::load(&label, format!("invalid {}: {}", path.display(), e)))
    }
}

/// Where an installed plugin comes from
#[derive(Clone)]
pub enum PluginSource {
    /// An already parsed manifest; `template_file` is not available
    Manifest(PluginManifest),
    /// A package directory containing `plugin.json`
    Directory(PathBuf),
    /// A compiled-in implementation
    Plugin(Arc<dyn Plugin>),
}

impl fmt::Debug for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginSource::Manifest(manifest) => f.debug_tuple("Manifest").field(&manifest.id).finish(),
            PluginSource::Directory(path) => f.debug_tuple("Directory").field(path).finish(),
            PluginSource::Plugin(_) => f.write_str("Plugin(..)"),
        }
    }
}

/// A plugin ready to be installed
pub struct LoadedPlugin {
    pub plugin: Arc<dyn Plugin>,
    pub description: String,
    /// Static files, for packages loaded from a directory
    pub assets: Option<PluginAssets>,
}

/// Resolves plugin sources to implementations
#[derive(Debug, Default, Clone, Copy)]
pub struct PluginLoader;

impl PluginLoader {
    pub fn new() -> Self {
        Self
    }

    pub fn load(&self, id: &str, source: PluginSource) -> Result<LoadedPlugin> {
        match source {
            PluginSource::Plugin(plugin) => Ok(LoadedPlugin {
                plugin,
                description: String::new(),
                assets: None,
            }),
            PluginSource::Manifest(manifest) => self.load_manifest(id, manifest, None),
            PluginSource::Directory(dir) => {
                let manifest = PluginManifest::read(&dir)?;
                let mut loaded = self.load_manifest(id, manifest, Some(&dir))?;
                loaded.assets = PluginAssets::discover(&dir);
                Ok(loaded)
            }
        }
    }

    fn load_manifest(
        &self,
        id: &str,
        manifest: PluginManifest,
        dir: Option<&Path>,
    ) -> Result<LoadedPlugin> {
        if manifest.id != id {
            return Err(PluginError::load(
                id,
                format!("manifest declares id {:?}", manifest.id),
            ));
        }

        let matcher = Matcher::compile(&manifest.rules).map_err(|e| PluginError::load(id, e))?;
        let content_type = manifest
            .content_type
            .clone()
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let plugin: Arc<dyn Plugin> = match manifest.entry_point.as_str() {
            "template" => {
                let source = template_source(id, &manifest, dir)?;
                Arc::new(TemplatePlugin::new(
                    id,
                    matcher,
                    content_type,
                    source,
                    manifest.defaults.clone(),
                )?)
            }
            "static" => {
                let content = manifest
                    .content
                    .clone()
                    .ok_or_else(|| PluginError::load(id, "static plugin has no content"))?;
                Arc::new(StaticPlugin {
                    matcher,
                    content_type,
                    content: Bytes::from(content),
                })
            }
            other => {
                return Err(PluginError::load(
                    id,
                    format!("unknown entry point {:?}", other),
                ))
            }
        };

        Ok(LoadedPlugin {
            plugin,
            description: manifest.description,
            assets: None,
        })
    }
}

fn template_source(id: &str, manifest: &PluginManifest, dir: Option<&Path>) -> Result<String> {
    if let Some(inline) = &manifest.template {
        return Ok(inline.clone());
    }
    let file = manifest
        .template_file
        .as_deref()
        .ok_or_else(|| PluginError::load(id, "template plugin has no template"))?;
    let dir = dir.ok_or_else(|| PluginError::load(id, "template_file needs a package directory"))?;

    let relative = Path::new(file);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(PluginError::load(
            id,
            format!("template_file {:?} escapes the package", file),
        ));
    }

    let path = dir.join(relative);
    std::fs::read_to_string(&path)
        .map_err(|e| PluginError::load(id, format!("cannot read {}: {}", path.display(), e)))
}

/// Renders one minijinja template per device
pub struct TemplatePlugin {
    matcher: Matcher,
    content_type: String,
    env: Environment<'static>,
    defaults: DeviceConfig,
}

impl TemplatePlugin {
    pub fn new(
        id: &str,
        matcher: Matcher,
        content_type: String,
        source: String,
        defaults: DeviceConfig,
    ) -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_template_owned(TEMPLATE_NAME, source)
            .map_err(|e| PluginError::load(id, format!("template syntax: {}", e)))?;
        Ok(Self {
            matcher,
            content_type,
            env,
            defaults,
        })
    }
}

impl Plugin for TemplatePlugin {
    fn rules(&self) -> &[MatchRule] {
        self.matcher.rules()
    }

    fn matches(&self, id: &DeviceIdentifier) -> bool {
        self.matcher.matches(id)
    }

    fn render(&self, id: &DeviceIdentifier, params: &RenderParams) -> std::result::Result<Bytes, RenderError> {
        let mut config = self.defaults.clone();
        config.extend(params.config.clone());

        let mac = id.as_mac();
        let rendered = self.env.get_template(TEMPLATE_NAME)?.render(context! {
            identifier => id.to_string(),
            mac => mac.map(|m| m.to_string()),
            mac_bare => mac.map(|m| m.to_bare(false)),
            requested => params.requested.clone(),
            config => config,
        })?;
        Ok(Bytes::from(rendered))
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }
}

/// Serves fixed content to every device it claims
pub struct StaticPlugin {
    matcher: Matcher,
    content_type: String,
    content: Bytes,
}

impl Plugin for StaticPlugin {
    fn rules(&self) -> &[MatchRule] {
        self.matcher.rules()
    }

    fn matches(&self, id: &DeviceIdentifier) -> bool {
        self.matcher.matches(id)
    }

    fn render(&self, _id: &DeviceIdentifier, _params: &RenderParams) -> std::result::Result<Bytes, RenderError> {
        Ok(self.content.clone())
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(id: &str, entry_point: &str) -> PluginManifest {
        PluginManifest {
            id: id.to_string(),
            version: Some("1.0".to_string()),
            description: String::new(),
            entry_point: entry_point.to_string(),
            content_type: None,
            rules: vec![MatchRule::MacPrefix {
                prefix: "00:11:22".to_string(),
            }],
            template: None,
            template_file: None,
            content: None,
            defaults: DeviceConfig::new(),
        }
    }

    fn device() -> DeviceIdentifier {
        DeviceIdentifier::Mac("00:11:22:aa:bb:cc".parse().unwrap())
    }

    #[test]
    fn test_template_plugin_renders_device_values() {
        let mut m = manifest("acme-sip", "template");
        m.template = Some("mac={{ mac }} bare={{ mac_bare }} proxy={{ config.proxy }}".to_string());
        m.content_type = Some("text/plain".to_string());
        m.defaults.insert("proxy".to_string(), json!("10.0.0.1"));

        let loaded = PluginLoader::new()
            .load("acme-sip", PluginSource::Manifest(m))
            .unwrap();
        let plugin = loaded.plugin;
        assert_eq!(plugin.content_type(), "text/plain");
        assert!(plugin.matches(&device()));

        let out = plugin.render(&device(), &RenderParams::new("cfg")).unwrap();
        assert_eq!(
            &out[..],
            b"mac=00:11:22:aa:bb:cc bare=001122aabbcc proxy=10.0.0.1"
        );

        // Per-device config wins over plugin defaults
        let mut overrides = DeviceConfig::new();
        overrides.insert("proxy".to_string(), json!("sip.example.net"));
        let out = plugin
            .render(&device(), &RenderParams::new("cfg").with_config(overrides))
            .unwrap();
        assert!(out.ends_with(b"proxy=sip.example.net"));
    }

    #[test]
    fn test_template_render_error_on_missing_value() {
        let mut m = manifest("acme-sip", "template");
        m.template = Some("{{ config.missing.deeper }}".to_string());
        let plugin = PluginLoader::new()
            .load("acme-sip", PluginSource::Manifest(m))
            .unwrap()
            .plugin;
        let err = plugin.render(&device(), &RenderParams::default()).unwrap_err();
        assert!(matches!(err, RenderError::Template(_)));
    }

    #[test]
    fn test_static_plugin() {
        let mut m = manifest("bootstrap", "static");
        m.content = Some("hello".to_string());
        let plugin = PluginLoader::new()
            .load("bootstrap", PluginSource::Manifest(m))
            .unwrap()
            .plugin;
        assert_eq!(plugin.content_type(), DEFAULT_CONTENT_TYPE);
        assert_eq!(&plugin.render(&device(), &RenderParams::default()).unwrap()[..], b"hello");
    }

    #[test]
    fn test_load_errors() {
        let loader = PluginLoader::new();

        let m = manifest("x", "python");
        assert!(matches!(
            loader.load("x", PluginSource::Manifest(m)),
            Err(PluginError::Load { .. })
        ));

        let mut m = manifest("x", "template");
        m.template = Some("{% if %}".to_string());
        assert!(matches!(
            loader.load("x", PluginSource::Manifest(m)),
            Err(PluginError::Load { .. })
        ));

        let m = manifest("x", "template");
        assert!(loader.load("x", PluginSource::Manifest(m)).is_err());

        let m = manifest("x", "static");
        assert!(loader.load("x", PluginSource::Manifest(m)).is_err());

        let m = manifest("other", "static");
        assert!(loader.load("x", PluginSource::Manifest(m)).is_err());

        let mut m = manifest("x", "static");
        m.content = Some(String::new());
        m.rules = vec![MatchRule::Token {
            pattern: "(".to_string(),
        }];
        assert!(loader.load("x", PluginSource::Manifest(m)).is_err());
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{
                "id": "acme-sip",
                "version": "2.1",
                "description": "Acme SIP phones",
                "entry_point": "template",
                "template_file": "templates/phone.cfg",
                "rules": [{"type": "mac_prefix", "prefix": "00:11:22"}]
            }"#,
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("templates")).unwrap();
        std::fs::write(dir.path().join("templates/phone.cfg"), "id={{ identifier }}").unwrap();

        let manifest = PluginManifest::read(dir.path()).unwrap();
        assert_eq!(manifest.version.as_deref(), Some("2.1"));

        let loaded = PluginLoader::new()
            .load("acme-sip", PluginSource::Directory(dir.path().to_path_buf()))
            .unwrap();
        assert_eq!(loaded.description, "Acme SIP phones");
        assert!(loaded.assets.is_none());
        let out = loaded.plugin.render(&device(), &RenderParams::default()).unwrap();
        assert_eq!(&out[..], b"id=00:11:22:aa:bb:cc");
    }

    #[test]
    fn test_directory_package_exposes_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"id": "acme", "entry_point": "static", "content": "x",
                "rules": [{"type": "mac_any"}]}"#,
        )
        .unwrap();
        std::fs::create_dir(dir.path().join(crate::assets::ASSETS_DIR)).unwrap();
        std::fs::write(dir.path().join("files/boot.bin"), b"boot").unwrap();

        let loaded = PluginLoader::new()
            .load("acme", PluginSource::Directory(dir.path().to_path_buf()))
            .unwrap();
        let assets = loaded.assets.unwrap();
        assert_eq!(&assets.read("boot.bin").unwrap()[..], b"boot");
        assert!(assets.read("../plugin.json").is_none());
    }

    #[test]
    fn test_template_file_cannot_escape_package() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"id": "x", "entry_point": "template", "template_file": "../secret",
                "rules": [{"type": "mac_any"}]}"#,
        )
        .unwrap();
        let result = PluginLoader::new().load("x", PluginSource::Directory(dir.path().to_path_buf()));
        assert!(matches!(result, Err(PluginError::Load { .. })));
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PluginManifest::read(dir.path()),
            Err(PluginError::Load { .. })
        ));
    }
}
