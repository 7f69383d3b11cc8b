//! Error types for plugin management and rendering

use thiserror::Error;

/// Error type for registry operations
#[derive(Debug, Error)]
pub enum PluginError {
    /// The package could not be turned into a servable plugin
    #[error("failed to load plugin {id}: {reason}")]
    Load { id: String, reason: String },

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin already installed: {0}")]
    AlreadyInstalled(String),

    /// Upgrade target does not sort after the installed version
    #[error("plugin {id}: version {requested} is not newer than installed {installed}")]
    NotNewer {
        id: String,
        installed: String,
        requested: String,
    },
}

impl PluginError {
    pub(crate) fn load(id: &str, reason: impl Into<String>) -> Self {
        PluginError::Load {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, PluginError>;

/// A plugin failed to produce a configuration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("template error: {0}")]
    Template(String),

    #[error("render failed: {0}")]
    Failed(String),
}

impl From<minijinja::Error> for RenderError {
    fn from(err: minijinja::Error) -> Self {
        RenderError::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PluginError::load("acme-sip", "no match rules");
        assert_eq!(err.to_string(), "failed to load plugin acme-sip: no match rules");

        let err = PluginError::NotNewer {
            id: "acme-sip".to_string(),
            installed: "1.10".to_string(),
            requested: "1.9".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "plugin acme-sip: version 1.9 is not newer than installed 1.10"
        );

        let err = RenderError::Failed("missing line".to_string());
        assert_eq!(err.to_string(), "render failed: missing line");
    }
}
