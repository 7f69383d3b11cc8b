use clap::Args;
use color_eyre::eyre::Result;
use mayfly_server::{ServerConfig, StoreConfig};
use mayfly_tftp::{TftpConfig, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address the TFTP server listens on
    #[arg(long, env = "MAYFLY_TFTP_BIND", default_value = "0.0.0.0:69")]
    pub tftp_bind: SocketAddr,

    /// Address the HTTP config server listens on
    #[arg(long, env = "MAYFLY_HTTP_BIND", default_value = "0.0.0.0:8667")]
    pub http_bind: SocketAddr,

    /// Device database file; devices are kept in memory when unset
    #[arg(long, env = "MAYFLY_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Directory of plugin packages to install at start-up
    #[arg(long, env = "MAYFLY_PLUGIN_DIR")]
    pub plugin_dir: Option<PathBuf>,

    /// Plugin serving devices no other plugin claims
    #[arg(long, env = "MAYFLY_AUTOPROV_PLUGIN")]
    pub autoprov_plugin: Option<String>,

    /// Seconds to wait for a TFTP acknowledgement before retransmitting
    #[arg(long, env = "MAYFLY_TFTP_TIMEOUT", default_value_t = 5)]
    pub tftp_timeout: u64,

    /// Retransmissions before a TFTP transfer is abandoned
    #[arg(long, env = "MAYFLY_TFTP_RETRIES", default_value_t = 5)]
    pub tftp_retries: u32,

    /// Largest TFTP block size granted to clients
    #[arg(
        long,
        env = "MAYFLY_MAX_BLOCK_SIZE",
        default_value_t = MAX_BLOCK_SIZE,
        value_parser = clap::value_parser!(u16).range(MIN_BLOCK_SIZE as i64..=MAX_BLOCK_SIZE as i64)
    )]
    pub max_block_size: u16,

    /// Do not start the TFTP server
    #[arg(long, env = "MAYFLY_NO_TFTP")]
    pub no_tftp: bool,

    /// Do not start the HTTP config server
    #[arg(long, env = "MAYFLY_NO_HTTP")]
    pub no_http: bool,
}

impl ServeArgs {
    pub fn to_config(&self) -> ServerConfig {
        let tftp = TftpConfig::default()
            .with_bind_addr(self.tftp_bind)
            .with_timeout(Duration::from_secs(self.tftp_timeout.max(1)))
            .with_max_retries(self.tftp_retries)
            .with_max_block_size(self.max_block_size);

        let store = match &self.db_path {
            Some(path) => StoreConfig::Redb { path: path.clone() },
            None => StoreConfig::Memory,
        };

        let mut config = ServerConfig::default()
            .with_tftp(tftp)
            .with_http_bind(self.http_bind)
            .with_store(store)
            .with_tftp_enabled(!self.no_tftp)
            .with_http_enabled(!self.no_http);
        if let Some(dir) = &self.plugin_dir {
            config = config.with_plugin_dir(dir);
        }
        if let Some(id) = &self.autoprov_plugin {
            config = config.with_autoprov_plugin(id);
        }
        config
    }
}

pub async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = args.to_config();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, shutting down"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    mayfly_server::run(config, shutdown_rx).await?;
    Ok(())
}
