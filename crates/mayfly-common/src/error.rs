use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Not found")]
    NotFound,

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
