//! Mayfly provisioning server
//!
//! Glues the TFTP engine and the plugin registry together: the device store,
//! the identification and dispatch engine that both wire protocols share,
//! the HTTP config endpoint, the administrative facade and the service
//! runner that keeps the listeners alive until shutdown.

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod services;
pub mod store;

pub use admin::{AdminError, AdminService, PackageReport};
pub use config::ServerConfig;
pub use dispatch::{
    extract_identifier, DispatchError, DispatchEvent, DispatchResolver, Dispatcher, HttpRequest,
    RawRequest, Resolution,
};
pub use services::{ServiceError, ServiceHandle, ServiceHandles, ServiceRunner};
pub use store::{create_store, DeviceStore, MemoryStore, RedbStore, StoreConfig, StoreError};

use mayfly_plugins::PluginRegistry;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

/// Start-up failures of the daemon
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Everything a running daemon is made of
#[derive(Debug, Clone)]
pub struct Daemon {
    pub dispatcher: Arc<Dispatcher>,
    pub admin: AdminService,
}

impl Daemon {
    /// Open the store, build the registry and install the plugin directory
    pub fn build(config: &ServerConfig) -> Result<Self, ServerError> {
        let store = create_store(&config.store)?;

        let mut registry = PluginRegistry::new();
        if let Some(autoprov) = &config.autoprov_plugin {
            registry = registry.with_autoprov(autoprov.clone());
        }

        let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), store));
        let admin = AdminService::new(dispatcher.clone());

        if let Some(dir) = &config.plugin_dir {
            admin.install_directory(dir)?;
        }
        if let Some(autoprov) = &config.autoprov_plugin {
            if admin.get_plugin(autoprov).is_err() {
                warn!(plugin = %autoprov, "Autoprovisioning plugin is not installed");
            }
        }

        Ok(Self { dispatcher, admin })
    }
}

/// Run the daemon until `shutdown` flips to true
pub async fn run(config: ServerConfig, shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
    let daemon = Daemon::build(&config)?;
    info!(
        plugins = daemon.admin.list_plugins().len(),
        store = ?config.store,
        "Provisioning daemon starting"
    );

    let runner = ServiceRunner::new(&config, daemon.dispatcher.clone());
    let handles = runner.start(shutdown).await?;
    handles.join().await;

    info!("Provisioning daemon stopped");
    Ok(())
}
