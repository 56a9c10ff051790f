//! Error types for shm-store-client.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::StatusCode;
use crate::types::ObjectId;

/// Main error type for all store client operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error on the store socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error while encoding a request.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Could not connect to the store socket.
    #[error("Failed to connect to {} after {attempts} attempt(s): {source}", path.display())]
    Connect {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Malformed reply (missing or ill-typed fields). The connection survives.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The byte stream can no longer be trusted (bad framing, misattributed reply).
    #[error("Connection corrupted: {0}")]
    ConnectionCorrupted(String),

    /// The server answered with a failure status.
    #[error("Server error {code:?}: {message}")]
    Status { code: StatusCode, message: String },

    /// Receiving an arena descriptor over the socket failed.
    #[error("Descriptor transfer failed: {0}")]
    DescriptorTransfer(String),

    /// Mapping an arena into the address space failed.
    #[error("Failed to map arena {store_fd} ({size} bytes): {source}")]
    Mapping {
        store_fd: i32,
        size: usize,
        #[source]
        source: std::io::Error,
    },

    /// A payload range falls outside its mapping.
    #[error("Range [{offset}, {offset}+{len}) exceeds mapping of {map_len} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        map_len: usize,
    },

    /// The server allocated a different size than requested.
    #[error("Size mismatch: requested {requested} bytes, server allocated {allocated}")]
    SizeMismatch { requested: usize, allocated: usize },

    /// The object has a size but its payload is not mapped in this process.
    #[error("Object {0} is (partially) remote: its payload is not available locally")]
    PartialObject(ObjectId),

    /// Operation attempted while not connected.
    #[error("Not connected")]
    NotConnected,

    /// No reply within the configured timeout.
    #[error("Timed out after {0:?} waiting for the store")]
    Timeout(Duration),

    /// Server speaks an incompatible protocol version.
    #[error("Incompatible server version {server} (client speaks {client})")]
    IncompatibleVersion { server: String, client: String },
}

impl StoreError {
    /// Status code carried by a server failure, if any.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            StoreError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the server reported that the object (or name) does not exist.
    pub fn is_object_not_exists(&self) -> bool {
        self.status_code() == Some(StatusCode::ObjectNotExists)
    }

    /// Whether the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::Timeout(_) | StoreError::ConnectionCorrupted(_)
        )
    }

    pub(crate) fn status(code: StatusCode, message: impl Into<String>) -> Self {
        StoreError::Status {
            code,
            message: message.into(),
        }
    }
}

/// Result type alias using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;
