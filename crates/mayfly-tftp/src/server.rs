//! TFTP server implementation
//!
//! The listener socket only ever sees read requests. Each accepted request
//! gets its own tokio task and its own ephemeral socket, and is driven by a
//! [`TransferSession`] until it completes, fails or times out.

use crate::error::{ResolveError, Result, TftpError};
use crate::packet::{ErrorCode, Request, TftpPacket};
use crate::session::{SessionAction, SessionConfig, SessionGuard, SessionState, TransferSession};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Well-known TFTP port
pub const TFTP_PORT: u16 = 69;

/// Default time a session waits for its file to be resolved
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration
#[derive(Debug, Clone)]
pub struct TftpConfig {
    /// Listener address
    pub bind_addr: SocketAddr,

    /// Per-transfer protocol limits
    pub session: SessionConfig,

    /// How long a session waits for its resolver before giving up
    pub resolve_timeout: Duration,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), TFTP_PORT),
            session: SessionConfig::default(),
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }
}

impl TftpConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.session.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.session.max_retries = retries;
        self
    }

    pub fn with_max_block_size(mut self, size: u16) -> Self {
        self.session.max_block_size = size;
        self
    }

    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }
}

/// What a resolver is asked for
#[derive(Debug, Clone)]
pub struct TftpRequest {
    /// Requested filename with leading `/` and `\` removed
    pub filename: String,

    /// Client address
    pub peer: SocketAddr,

    /// Revoked when the session ends without completing
    pub guard: SessionGuard,
}

/// Trait for producing the contents of a requested file
#[async_trait]
pub trait FileResolver: Send + Sync {
    async fn resolve(&self, request: &TftpRequest) -> std::result::Result<Bytes, ResolveError>;
}

/// Event emitted by the TFTP server
#[derive(Debug, Clone)]
pub enum TftpEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// File resolved, streaming begins
    TransferStarted {
        client: SocketAddr,
        filename: String,
        size: u64,
    },
    /// Last block acknowledged
    TransferCompleted {
        client: SocketAddr,
        filename: String,
        bytes_sent: u64,
    },
    /// Request refused or transfer abandoned
    TransferFailed {
        client: SocketAddr,
        filename: String,
        error: String,
    },
    /// Server stopped
    Stopped,
}

/// TFTP server
pub struct TftpServer {
    config: TftpConfig,
    resolver: Arc<dyn FileResolver>,
    event_sender: broadcast::Sender<TftpEvent>,
    active: Arc<Mutex<HashSet<SocketAddr>>>,
}

impl TftpServer {
    /// Create a new TFTP server
    pub fn new(config: TftpConfig, resolver: Arc<dyn FileResolver>) -> Self {
        let (event_sender, _) = broadcast::channel(1024);
        Self {
            config,
            resolver,
            event_sender,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Subscribe to server events
    pub fn subscribe(&self) -> broadcast::Receiver<TftpEvent> {
        self.event_sender.subscribe()
    }

    pub fn config(&self) -> &TftpConfig {
        &self.config
    }

    /// Bind the listener socket
    pub async fn bind(&self) -> Result<UdpSocket> {
        let addr = self.config.bind_addr;
        UdpSocket::bind(addr)
            .await
            .map_err(|e| TftpError::BindFailed { addr, source: e })
    }

    /// Bind and serve until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = self.bind().await?;
        self.serve(socket, shutdown).await
    }

    /// Serve requests arriving on an already bound listener
    pub async fn serve(&self, socket: UdpSocket, shutdown: watch::Receiver<bool>) -> Result<()> {
        let bind_addr = socket.local_addr()?;
        info!(addr = %bind_addr, "TFTP server started");
        let _ = self.event_sender.send(TftpEvent::Started { bind_addr });

        let mut buf = vec![0u8; 65536];
        let mut shutdown = shutdown;

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => self.dispatch(&buf[..len], src, bind_addr.ip()).await,
                        Err(e) => {
                            error!(error = %e, "Error receiving packet");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender means nobody is left to stop us cleanly
                    if changed.is_err() || *shutdown.borrow() {
                        info!("TFTP server shutting down");
                        let _ = self.event_sender.send(TftpEvent::Stopped);
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Route one datagram received on the listener
    async fn dispatch(&self, data: &[u8], client: SocketAddr, local_ip: IpAddr) {
        let packet = match TftpPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(client = %client, error = %e, "Dropping malformed datagram");
                return;
            }
        };

        match packet {
            TftpPacket::ReadRequest(request) => {
                let Some(active) = ActivePeer::claim(&self.active, client) else {
                    debug!(client = %client, filename = %request.filename, "Duplicate request from active peer");
                    return;
                };

                let context = SessionContext {
                    config: self.config.clone(),
                    resolver: self.resolver.clone(),
                    event_sender: self.event_sender.clone(),
                    local_ip,
                };
                tokio::spawn(async move {
                    let _active = active;
                    if let Err(e) = run_session(context, client, request).await {
                        error!(error = %e, client = %client, "Error handling TFTP request");
                    }
                });
            }
            TftpPacket::WriteRequest(request) => {
                debug!(client = %client, filename = %request.filename, "Refusing write request");
                if let Err(e) = send_error(
                    local_ip,
                    client,
                    ErrorCode::IllegalOperation,
                    "write requests are not supported",
                )
                .await
                {
                    warn!(error = %e, client = %client, "Failed to refuse write request");
                }
            }
            other => {
                debug!(client = %client, packet = ?other, "Ignoring unexpected packet on listener");
            }
        }
    }
}

impl std::fmt::Debug for TftpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TftpServer")
            .field("bind_addr", &self.config.bind_addr)
            .finish_non_exhaustive()
    }
}

/// Membership in the active peer set, released on drop
struct ActivePeer {
    set: Arc<Mutex<HashSet<SocketAddr>>>,
    peer: SocketAddr,
}

impl ActivePeer {
    fn claim(set: &Arc<Mutex<HashSet<SocketAddr>>>, peer: SocketAddr) -> Option<Self> {
        let mut peers = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !peers.insert(peer) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            peer,
        })
    }
}

impl Drop for ActivePeer {
    fn drop(&mut self) {
        let mut peers = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        peers.remove(&self.peer);
    }
}

/// Everything a session task needs from the server
struct SessionContext {
    config: TftpConfig,
    resolver: Arc<dyn FileResolver>,
    event_sender: broadcast::Sender<TftpEvent>,
    local_ip: IpAddr,
}

impl SessionContext {
    fn failed(&self, client: SocketAddr, filename: &str, error: impl Into<String>) {
        let _ = self.event_sender.send(TftpEvent::TransferFailed {
            client,
            filename: filename.to_string(),
            error: error.into(),
        });
    }
}

/// Strip the leading separators clients like to prepend
fn clean_filename(raw: &str) -> String {
    raw.trim_start_matches(['/', '\\']).to_string()
}

/// Resolve, then stream one file to one client
async fn run_session(context: SessionContext, client: SocketAddr, request: Request) -> Result<()> {
    let socket = UdpSocket::bind(SocketAddr::new(context.local_ip, 0))
        .await
        .map_err(TftpError::Io)?;

    let mut session = TransferSession::new(client, context.config.session.clone());
    debug!(
        client = %client,
        filename = %request.filename,
        mode = %request.mode.as_str(),
        ignored_options = ?request.options.ignored,
        "Read request"
    );

    let filename = match session.on_request(&request) {
        SessionAction::Resolve { filename } => clean_filename(&filename),
        SessionAction::Fail(packet) => {
            warn!(client = %client, mode = %request.mode.as_str(), "Unsupported transfer mode");
            socket.send_to(&packet, client).await?;
            context.failed(client, &request.filename, "unsupported transfer mode");
            return Ok(());
        }
        _ => return Ok(()),
    };

    let tftp_request = TftpRequest {
        filename: filename.clone(),
        peer: client,
        guard: session.guard(),
    };

    let first = match timeout(
        context.config.resolve_timeout,
        context.resolver.resolve(&tftp_request),
    )
    .await
    {
        Ok(Ok(data)) => {
            let size = data.len() as u64;
            let _ = context.event_sender.send(TftpEvent::TransferStarted {
                client,
                filename: filename.clone(),
                size,
            });
            session.start(data)
        }
        Ok(Err(e)) => {
            match &e {
                ResolveError::NotFound(_) => {
                    debug!(client = %client, filename = %filename, "File not found")
                }
                ResolveError::AccessDenied(_) => {
                    warn!(client = %client, filename = %filename, error = %e, "Access violation")
                }
                ResolveError::Failed(_) => {
                    warn!(client = %client, filename = %filename, error = %e, "Failed to resolve file")
                }
            }
            context.failed(client, &filename, e.to_string());
            session.reject(e.error_code(), &e.to_string())
        }
        Err(_) => {
            session.expire();
            warn!(client = %client, filename = %filename, "Timed out resolving file");
            context.failed(client, &filename, "timed out resolving file");
            return Ok(());
        }
    };

    drive(&context, &socket, &mut session, first).await
}

/// Run the send/receive loop until the session reaches a terminal state
async fn drive(
    context: &SessionContext,
    socket: &UdpSocket,
    session: &mut TransferSession,
    first: SessionAction,
) -> Result<()> {
    let client = session.peer();
    let filename = session.filename().to_string();
    let mut buf = vec![0u8; 1024];
    let mut deadline = Instant::now() + session.timeout();
    let mut action = first;

    loop {
        match action {
            SessionAction::Send(packet) => {
                socket.send_to(&packet, client).await?;
                deadline = Instant::now() + session.timeout();
            }
            SessionAction::Fail(packet) => {
                socket.send_to(&packet, client).await?;
                return Ok(());
            }
            SessionAction::Complete => {
                info!(
                    client = %client,
                    filename = %filename,
                    bytes = session.bytes_sent(),
                    block_size = session.block_size(),
                    "Transfer completed"
                );
                let _ = context.event_sender.send(TftpEvent::TransferCompleted {
                    client,
                    filename,
                    bytes_sent: session.bytes_sent(),
                });
                return Ok(());
            }
            SessionAction::Abort => {
                if session.state() == SessionState::TimedOut {
                    warn!(
                        client = %client,
                        filename = %filename,
                        block = session.block(),
                        "Transfer timed out"
                    );
                    context.failed(client, &filename, "timeout");
                } else {
                    debug!(client = %client, filename = %filename, "Client aborted transfer");
                    context.failed(client, &filename, "aborted by client");
                }
                return Ok(());
            }
            SessionAction::Ignore | SessionAction::Resolve { .. } => {}
        }

        action = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) if from == client => session.on_datagram(&buf[..len]),
            Ok(Ok((_, from))) => {
                debug!(client = %client, stranger = %from, "Datagram from unknown transfer ID");
                send_error_on(socket, from, ErrorCode::UnknownTransferId, "unknown transfer ID")
                    .await?;
                SessionAction::Ignore
            }
            Ok(Err(e)) => return Err(TftpError::Io(e)),
            Err(_) => {
                debug!(
                    client = %client,
                    block = session.block(),
                    retry = session.retries() + 1,
                    "Retransmitting"
                );
                session.on_timeout()
            }
        };
    }
}

/// Send an error packet to client (using new socket)
async fn send_error(local_ip: IpAddr, client: SocketAddr, code: ErrorCode, message: &str) -> Result<()> {
    let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0))
        .await
        .map_err(TftpError::Io)?;

    send_error_on(&socket, client, code, message).await
}

/// Send an error packet on existing socket
async fn send_error_on(
    socket: &UdpSocket,
    client: SocketAddr,
    code: ErrorCode,
    message: &str,
) -> Result<()> {
    let error = TftpPacket::error(code, message);
    socket
        .send_to(&error.encode(), client)
        .await
        .map_err(TftpError::Io)?;
    Ok(())
}

/// In-memory resolver for tests and static files
#[derive(Debug, Default)]
pub struct MemoryResolver {
    files: HashMap<String, Bytes>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file
    pub fn add_file(&mut self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.files.insert(path.into(), data.into());
    }
}

#[async_trait]
impl FileResolver for MemoryResolver {
    async fn resolve(&self, request: &TftpRequest) -> std::result::Result<Bytes, ResolveError> {
        self.files
            .get(&request.filename)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(request.filename.clone()))
    }
}
