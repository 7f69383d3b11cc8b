//! Daemon configuration

use crate::store::StoreConfig;
use mayfly_tftp::TftpConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Default HTTP config server port
pub const HTTP_PORT: u16 = 8667;

/// Everything needed to run the provisioning daemon
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TFTP listener and transfer limits
    pub tftp: TftpConfig,

    /// HTTP config server listener
    pub http_bind: SocketAddr,

    pub store: StoreConfig,

    /// Directory of plugin packages installed at start-up
    pub plugin_dir: Option<PathBuf>,

    /// Plugin serving devices that nothing else claims
    pub autoprov_plugin: Option<String>,

    pub enable_tftp: bool,
    pub enable_http: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tftp: TftpConfig::default(),
            http_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), HTTP_PORT),
            store: StoreConfig::default(),
            plugin_dir: None,
            autoprov_plugin: None,
            enable_tftp: true,
            enable_http: true,
        }
    }
}

impl ServerConfig {
    pub fn with_tftp(mut self, tftp: TftpConfig) -> Self {
        self.tftp = tftp;
        self
    }

    pub fn with_http_bind(mut self, addr: SocketAddr) -> Self {
        self.http_bind = addr;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = Some(dir.into());
        self
    }

    pub fn with_autoprov_plugin(mut self, id: impl Into<String>) -> Self {
        self.autoprov_plugin = Some(id.into());
        self
    }

    pub fn with_tftp_enabled(mut self, enabled: bool) -> Self {
        self.enable_tftp = enabled;
        self
    }

    pub fn with_http_enabled(mut self, enabled: bool) -> Self {
        self.enable_http = enabled;
        self
    }
}
