//! Per-client transfer state machine
//!
//! A [`TransferSession`] owns everything one read transfer needs: the
//! negotiated block size, the current block number, the retry counter and the
//! last packet sent. It performs no I/O. The server feeds it the request,
//! the resolved file contents, every datagram from the peer and every
//! timer expiry, and it answers each of those with a [`SessionAction`].
//!
//! ```text
//! AwaitingRequest ──on_request──▶ OptionNegotiated ──start──▶ Sending ──▶ Done
//!        │                               │                      │
//!        └────── bad mode ──▶ Errored ◀──┴── reject / peer ERROR┘
//!                                                               └──▶ TimedOut
//! ```

use crate::packet::{ErrorCode, Request, TftpOptions, TftpPacket, TransferMode};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default block size (RFC 1350)
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Smallest block size we agree to (RFC 2348)
pub const MIN_BLOCK_SIZE: u16 = 8;

/// Largest block size we agree to (RFC 2348)
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Default retransmission timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum retransmissions of one packet
pub const MAX_RETRIES: u32 = 5;

/// Protocol limits applied to every session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub min_block_size: u16,
    pub max_block_size: u16,
    /// Time to wait for an acknowledgement before retransmitting
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_block_size: MIN_BLOCK_SIZE,
            max_block_size: MAX_BLOCK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            max_retries: MAX_RETRIES,
        }
    }
}

impl SessionConfig {
    fn clamp_block_size(&self, requested: u16) -> u16 {
        let max = self.max_block_size.max(self.min_block_size);
        requested.clamp(self.min_block_size, max)
    }
}

/// Lifecycle of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRequest,
    OptionNegotiated,
    Sending,
    Done,
    Errored,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Errored | SessionState::TimedOut
        )
    }
}

/// What the driver must do after feeding the session an input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Request accepted, resolve this filename then call `start` or `reject`
    Resolve { filename: String },
    /// Send this datagram to the peer and keep going
    Send(Bytes),
    /// Nothing to do (duplicate, late, malformed or foreign packet)
    Ignore,
    /// Last block acknowledged, transfer finished
    Complete,
    /// Send this error datagram, then end the session
    Fail(Bytes),
    /// End the session without telling the peer
    Abort,
}

/// Revocable liveness token shared between a session and its resolver
///
/// A resolver that outlives its session (a slow render, for instance) checks
/// [`SessionGuard::is_live`] before committing side effects.
#[derive(Debug, Clone)]
pub struct SessionGuard(Arc<AtomicBool>);

impl SessionGuard {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// State of a single read transfer
#[derive(Debug)]
pub struct TransferSession {
    peer: SocketAddr,
    config: SessionConfig,
    state: SessionState,
    filename: String,
    block_size: u16,
    /// Options to echo in the OACK; `None` when the client asked for none we honour
    oack: Option<TftpOptions>,
    source: Bytes,
    /// Bytes of `source` covered by the data blocks sent so far
    offset: usize,
    /// Most recently sent, unacknowledged block (0 before any data block)
    block: u16,
    final_block_sent: bool,
    blocks_sent: u64,
    last_packet: Option<Bytes>,
    retries: u32,
    guard: SessionGuard,
}

impl TransferSession {
    pub fn new(peer: SocketAddr, config: SessionConfig) -> Self {
        Self {
            peer,
            config,
            state: SessionState::AwaitingRequest,
            filename: String::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            oack: None,
            source: Bytes::new(),
            offset: 0,
            block: 0,
            final_block_sent: false,
            blocks_sent: 0,
            last_packet: None,
            retries: 0,
            guard: SessionGuard::new(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    pub fn block(&self) -> u16 {
        self.block
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Distinct data blocks sent, retransmissions excluded
    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.offset as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.source.len() as u64
    }

    /// Options echoed in the OACK, if one is (or will be) sent
    pub fn negotiated_options(&self) -> Option<&TftpOptions> {
        self.oack.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn guard(&self) -> SessionGuard {
        self.guard.clone()
    }

    /// Validate the read request and negotiate options
    pub fn on_request(&mut self, request: &Request) -> SessionAction {
        if self.state != SessionState::AwaitingRequest {
            return SessionAction::Ignore;
        }

        self.filename = request.filename.clone();

        if request.mode != TransferMode::Octet {
            return self.fail(
                ErrorCode::IllegalOperation,
                &format!("unsupported transfer mode: {}", request.mode.as_str()),
            );
        }

        let requested = &request.options;
        if let Some(blksize) = requested.blksize {
            self.block_size = self.config.clamp_block_size(blksize);
        }
        if !requested.is_empty() {
            self.oack = Some(TftpOptions {
                blksize: requested.blksize.map(|_| self.block_size),
                // Filled in with the real size once the file is known
                tsize: requested.tsize.map(|_| 0),
                ignored: Vec::new(),
            });
        }

        self.state = SessionState::OptionNegotiated;
        SessionAction::Resolve {
            filename: self.filename.clone(),
        }
    }

    /// Begin streaming the resolved file
    ///
    /// Sends the OACK when options were negotiated, otherwise block 1.
    pub fn start(&mut self, source: Bytes) -> SessionAction {
        if self.state != SessionState::OptionNegotiated {
            return SessionAction::Ignore;
        }

        self.source = source;
        self.state = SessionState::Sending;

        let file_size = self.source.len() as u64;
        match self.oack.as_mut() {
            Some(options) => {
                if options.tsize.is_some() {
                    options.tsize = Some(file_size);
                }
                let packet = TftpPacket::oack(options.clone()).encode();
                self.block = 0;
                self.retries = 0;
                self.last_packet = Some(packet.clone());
                SessionAction::Send(packet)
            }
            None => self.send_block(1),
        }
    }

    /// Refuse the request after resolution failed
    pub fn reject(&mut self, code: ErrorCode, message: &str) -> SessionAction {
        if self.state.is_terminal() {
            return SessionAction::Ignore;
        }
        self.fail(code, message)
    }

    /// Feed a datagram received from the session peer
    pub fn on_datagram(&mut self, data: &[u8]) -> SessionAction {
        if self.state != SessionState::Sending {
            return SessionAction::Ignore;
        }

        let packet = match TftpPacket::parse(data) {
            Ok(packet) => packet,
            Err(_) => return SessionAction::Ignore,
        };

        match packet {
            TftpPacket::Ack { block } if block == self.block => {
                if self.blocks_sent == 0 {
                    // ACK 0 for our OACK
                    return self.send_block(1);
                }
                if self.final_block_sent {
                    self.state = SessionState::Done;
                    return SessionAction::Complete;
                }
                self.send_block(self.block.wrapping_add(1))
            }
            // Duplicate, late or premature acknowledgement
            TftpPacket::Ack { .. } => SessionAction::Ignore,
            TftpPacket::Error { .. } => {
                self.state = SessionState::Errored;
                self.guard.revoke();
                SessionAction::Abort
            }
            _ => SessionAction::Ignore,
        }
    }

    /// The acknowledgement timer expired
    pub fn on_timeout(&mut self) -> SessionAction {
        if self.state != SessionState::Sending {
            return SessionAction::Ignore;
        }

        self.retries += 1;
        if self.retries > self.config.max_retries {
            self.state = SessionState::TimedOut;
            self.guard.revoke();
            return SessionAction::Abort;
        }

        match &self.last_packet {
            Some(packet) => SessionAction::Send(packet.clone()),
            None => SessionAction::Ignore,
        }
    }

    /// Abandon the session, e.g. because resolution took too long
    pub fn expire(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::TimedOut;
        }
        self.guard.revoke();
    }

    fn send_block(&mut self, block: u16) -> SessionAction {
        let block_size = self.block_size as usize;
        let end = (self.offset + block_size).min(self.source.len());
        let data = self.source.slice(self.offset..end);

        // A short block (zero-length for exact multiples) ends the transfer
        self.final_block_sent = data.len() < block_size;
        self.offset = end;
        self.block = block;
        self.blocks_sent += 1;
        self.retries = 0;

        let packet = TftpPacket::data(block, data).encode();
        self.last_packet = Some(packet.clone());
        SessionAction::Send(packet)
    }

    fn fail(&mut self, code: ErrorCode, message: &str) -> SessionAction {
        self.state = SessionState::Errored;
        self.guard.revoke();
        SessionAction::Fail(TftpPacket::error(code, message).encode())
    }
}
