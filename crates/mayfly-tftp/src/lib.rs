//! Mayfly TFTP Server
//!
//! This crate provides the read-only TFTP server phones and adapters use to
//! fetch their configuration files. It implements RFC 1350 (TFTP) in octet
//! mode with the option extension of RFC 2347, block size negotiation
//! (RFC 2348) and transfer size reporting (RFC 2349).
//!
//! # Features
//!
//! - Read support only; write requests are refused
//! - Octet mode only; `netascii` and `mail` are answered with an error
//! - Unknown options are left out of the OACK rather than rejected
//! - One tokio task and one ephemeral socket per transfer
//! - A sans-IO [`TransferSession`] state machine, testable without sockets
//! - Pluggable [`FileResolver`] trait for producing file contents
//!
//! # Example
//!
//! ```ignore
//! use mayfly_tftp::{MemoryResolver, TftpConfig, TftpServer};
//! use std::sync::Arc;
//!
//! let mut resolver = MemoryResolver::new();
//! resolver.add_file("cfg.bin", vec![0u8; 1024]);
//!
//! let server = TftpServer::new(TftpConfig::default(), Arc::new(resolver));
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! server.run(shutdown_rx).await?;
//! ```

pub mod error;
pub mod packet;
pub mod server;
pub mod session;

pub use error::*;
pub use packet::*;
pub use server::*;
pub use session::*;
