//! Static files shipped inside a plugin package
//!
//! A package directory may carry a `files/` subdirectory (firmware images,
//! ringtones, locale bundles). Those files are served verbatim to any
//! requester. Only regular files are ever returned: a directory has no
//! listing and a symlink may not lead out of the package.

use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Subdirectory of a package holding its static files
pub const ASSETS_DIR: &str = "files";

/// Content type for static package files
pub const ASSET_CONTENT_TYPE: &str = "application/octet-stream";

/// The `files/` directory of one package
#[derive(Debug, Clone)]
pub struct PluginAssets {
    root: PathBuf,
}

impl PluginAssets {
    /// Assets of the package at `dir`, if it has a `files/` directory
    pub fn discover(dir: &Path) -> Option<Self> {
        let root = dir.join(ASSETS_DIR);
        root.is_dir().then_some(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read one file by its path relative to `files/`
    ///
    /// Returns `None` for anything that is not a regular file inside the
    /// package.
    pub fn read(&self, requested: &str) -> Option<Bytes> {
        let requested = requested.trim_start_matches('/');
        let relative = Path::new(requested);
        if requested.is_empty()
            || requested.contains('\\')
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }

        let path = self.root.join(relative);
        let resolved = path.canonicalize().ok()?;
        let root = self.root.canonicalize().ok()?;
        if !resolved.starts_with(&root) {
            warn!(path = %requested, "Blocked asset outside its package");
            return None;
        }
        if !std::fs::metadata(&resolved).is_ok_and(|m| m.is_file()) {
            return None;
        }

        match std::fs::read(&resolved) {
            Ok(contents) => Some(Bytes::from(contents)),
            Err(e) => {
                debug!(path = %resolved.display(), error = %e, "Asset unreadable");
                None
            }
        }
    }
}
