//! Error types for the sync engine.

use cupnote_sync_protocol::{RecordId, RecordType};
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for local store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the local datastore.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The record does not exist.
    #[error("{record_type} record {id} not found")]
    NotFound {
        /// Record type.
        record_type: RecordType,
        /// Record ID.
        id: RecordId,
    },

    /// A record with this ID already exists.
    #[error("{record_type} record {id} already exists")]
    Conflict {
        /// Record type.
        record_type: RecordType,
        /// Record ID.
        id: RecordId,
    },

    /// The underlying datastore failed.
    #[error("datastore failure: {0}")]
    Backend(String),
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No connectivity, DNS failure, connection refused.
    #[error("network error: {0}")]
    Network(String),

    /// The operation exceeded its deadline.
    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The backend rejected the request (HTTP 4xx).
    #[error("request rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// Missing or expired session (HTTP 401/403).
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// The backend failed (HTTP 5xx).
    #[error("server error ({status}): {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// Writing to the local datastore failed.
    #[error("local write failed: {0}")]
    LocalWrite(#[from] StoreError),

    /// The device is offline.
    #[error("No internet connection")]
    NotConnected,

    /// The record asked for does not exist locally.
    #[error("{record_type} record not found: {id}")]
    RecordNotFound {
        /// Record type.
        record_type: RecordType,
        /// Record ID.
        id: RecordId,
    },

    /// A remote body could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Sync is switched off in the configuration.
    #[error("sync is disabled")]
    SyncDisabled,
}

impl SyncError {
    /// Classifies a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => SyncError::Unauthorized(message),
            500..=599 => SyncError::Server { status, message },
            _ => SyncError::Rejected { status, message },
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) => true,
            SyncError::Timeout(_) => true,
            SyncError::Server { .. } => true,
            _ => false,
        }
    }

    /// Returns true if this error must abort the whole pass rather than
    /// just the record being processed.
    pub fn is_phase_fatal(&self) -> bool {
        matches!(self, SyncError::Unauthorized(_) | SyncError::NotConnected)
    }
}
