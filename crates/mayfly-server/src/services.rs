//! Network Services Runner
//!
//! Starts the two wire protocol surfaces in front of the dispatcher:
//! - TFTP server for phones fetching configs by filename
//! - HTTP config server for phones that provision over HTTP
//!
//! Either can be disabled. Sockets are bound before anything is spawned so
//! that a port conflict fails start-up instead of a background task.

use crate::config::ServerConfig;
use crate::dispatch::{DispatchEvent, DispatchResolver, Dispatcher};
use crate::http;
use mayfly_tftp::{TftpConfig, TftpEvent, TftpServer};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("TFTP server error: {0}")]
    Tftp(String),

    #[error("HTTP server error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network services runner
pub struct ServiceRunner {
    tftp: Option<TftpConfig>,
    http_bind: Option<SocketAddr>,
    dispatcher: Arc<Dispatcher>,
}

impl ServiceRunner {
    pub fn new(config: &ServerConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            tftp: config.enable_tftp.then(|| config.tftp.clone()),
            http_bind: config.enable_http.then_some(config.http_bind),
            dispatcher,
        }
    }

    /// Start all configured services
    ///
    /// Returns handles for monitoring service events.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<ServiceHandles, ServiceError> {
        let mut handles = ServiceHandles::default();

        if let Some(ref tftp_config) = self.tftp {
            handles.tftp = Some(self.start_tftp(tftp_config.clone(), shutdown.clone()).await?);
        }

        if let Some(addr) = self.http_bind {
            handles.http = Some(self.start_http(addr, shutdown.clone()).await?);
        }

        Ok(handles)
    }

    async fn start_tftp(
        &self,
        config: TftpConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ServiceHandle<TftpEvent>, ServiceError> {
        let resolver = DispatchResolver::new(self.dispatcher.clone());
        let server = Arc::new(TftpServer::new(config, Arc::new(resolver)));

        let socket = server
            .bind()
            .await
            .map_err(|e| ServiceError::Tftp(e.to_string()))?;
        let local_addr = socket.local_addr()?;
        let events = server.subscribe();

        info!(bind_addr = %local_addr, "Starting TFTP server");

        let join_handle = tokio::spawn(async move {
            if let Err(e) = server.serve(socket, shutdown).await {
                error!(error = %e, "TFTP server error");
            }
        });

        Ok(ServiceHandle {
            local_addr,
            events,
            join_handle,
        })
    }

    async fn start_http(
        &self,
        addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ServiceHandle<DispatchEvent>, ServiceError> {
        let listener = http::bind(addr)
            .await
            .map_err(|e| ServiceError::Http(format!("cannot bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        let dispatcher = self.dispatcher.clone();
        let events = dispatcher.subscribe();

        let join_handle = tokio::spawn(async move {
            if let Err(e) = http::serve(listener, dispatcher, shutdown).await {
                error!(error = %e, "HTTP server error");
            }
        });

        Ok(ServiceHandle {
            local_addr,
            events,
            join_handle,
        })
    }
}

/// Handles to running services
#[derive(Default)]
pub struct ServiceHandles {
    pub tftp: Option<ServiceHandle<TftpEvent>>,
    /// Carries the dispatcher's resolution events
    pub http: Option<ServiceHandle<DispatchEvent>>,
}

impl ServiceHandles {
    /// Wait for every started service to exit
    pub async fn join(self) {
        for handle in [self.tftp.map(|h| h.join_handle), self.http.map(|h| h.join_handle)]
            .into_iter()
            .flatten()
        {
            if let Err(e) = handle.await {
                error!(error = %e, "Service task panicked");
            }
        }
    }
}

/// Handle to a single service
pub struct ServiceHandle<E> {
    /// Address actually bound, useful when the configured port is 0
    pub local_addr: SocketAddr,
    pub events: broadcast::Receiver<E>,
    pub join_handle: JoinHandle<()>,
}
