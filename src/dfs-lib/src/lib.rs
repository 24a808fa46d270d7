mod checksum;
mod config;
pub mod keys;
mod packet;
mod protocol;
mod types;

pub use checksum::*;
pub use config::*;
pub use packet::*;
pub use protocol::*;
pub use types::*;

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum DfsError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("endpoint unavailable: {0}")]
    EndpointUnavailable(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("corrupt data: {0}")]
    CorruptData(String),
    #[error("replica stale: {0}")]
    ReplicaStale(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("block not replicated yet: {0}")]
    NotReplicatedYet(String),
    #[error("pipeline node {index} failed: {reason}")]
    PipelineNodeFailed { index: usize, reason: String },
    #[error("pipeline failed: {0}")]
    PipelineFailed(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Coarse classification that drives retry, failover and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientNetwork,
    EndpointUnavailable,
    ProtocolViolation,
    AuthFailure,
    ReplicaStale,
    ResourceExhausted,
    Fatal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork
                | ErrorKind::EndpointUnavailable
                | ErrorKind::ResourceExhausted
        )
    }
}

impl DfsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DfsError::Network(_)
            | DfsError::Timeout(_)
            | DfsError::NotReplicatedYet(_)
            | DfsError::PipelineNodeFailed { .. } => ErrorKind::TransientNetwork,
            DfsError::EndpointUnavailable(_) => ErrorKind::EndpointUnavailable,
            DfsError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            DfsError::AuthFailure(_) => ErrorKind::AuthFailure,
            DfsError::ReplicaStale(_) => ErrorKind::ReplicaStale,
            DfsError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DfsError::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DfsError::NotFound(_))
    }
}

pub type DfsResult<T> = std::result::Result<T, DfsError>;

impl From<std::io::Error> for DfsError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        match err.kind() {
            IoKind::TimedOut | IoKind::WouldBlock => DfsError::Timeout(err.to_string()),
            IoKind::ConnectionRefused | IoKind::AddrNotAvailable => {
                DfsError::EndpointUnavailable(err.to_string())
            }
            IoKind::ConnectionReset
            | IoKind::ConnectionAborted
            | IoKind::BrokenPipe
            | IoKind::NotConnected
            | IoKind::UnexpectedEof => DfsError::Network(err.to_string()),
            IoKind::PermissionDenied => DfsError::PermissionDenied(err.to_string()),
            IoKind::NotFound => DfsError::NotFound(err.to_string()),
            _ => DfsError::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for DfsError {
    fn from(err: serde_json::Error) -> Self {
        DfsError::InvalidConfig(err.to_string())
    }
}
