//! Error types for ringkv

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Replication Errors ===
    #[error("Node unavailable: {node}: {reason}")]
    NodeUnavailable { node: String, reason: String },

    #[error("Request {id} to {node} timed out")]
    RequestTimeout { node: String, id: Uuid },

    /// A hedge sibling resolved first; the result was discarded locally.
    #[error("Request superseded by a faster replica")]
    Superseded,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Wire Errors ===
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // === Storage Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn unavailable(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::NodeUnavailable {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Failures that are confined to a single replica attempt.
    ///
    /// Fan-out operations turn these into absent slots instead of failing
    /// the whole call. Nothing in the coordinator retries them.
    pub fn is_replica_failure(&self) -> bool {
        matches!(
            self,
            Error::NodeUnavailable { .. }
                | Error::RequestTimeout { .. }
                | Error::Superseded
                | Error::Io(_)
                | Error::Codec(_)
                | Error::ChecksumMismatch { .. }
                | Error::Storage(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::InvalidArgument(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::RequestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::NodeUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::FrameTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
