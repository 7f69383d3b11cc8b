//! Errors raised by the TFTP server and its resolvers

use crate::packet::ErrorCode;
use std::net::SocketAddr;
use thiserror::Error;

/// Server-side failures
///
/// Per-transfer problems (timeouts, client aborts) are not errors here;
/// they end the session and surface as [`crate::TftpEvent::TransferFailed`].
#[derive(Debug, Error)]
pub enum TftpError {
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TFTP packet: {0}")]
    InvalidPacket(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TftpError>;

/// Why a resolver could not produce a file
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// Nothing to serve under that name (TFTP error 1)
    #[error("file not found: {0}")]
    NotFound(String),

    /// Refused (TFTP error 2)
    #[error("access violation: {0}")]
    AccessDenied(String),

    /// Anything else (TFTP error 0)
    #[error("{0}")]
    Failed(String),
}

impl ResolveError {
    /// TFTP error code sent to the client
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ResolveError::NotFound(_) => ErrorCode::FileNotFound,
            ResolveError::AccessDenied(_) => ErrorCode::AccessViolation,
            ResolveError::Failed(_) => ErrorCode::NotDefined,
        }
    }
}
