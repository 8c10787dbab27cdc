//! Error types for the sync engine.

use driftsync_protocol::{ChangeKey, ProtocolError};
use driftsync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A network call exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// Server failed to handle the request (5xx).
    #[error("server error: {0}")]
    ServerError(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The server refused a push as too large (HTTP 413).
    #[error("request too large: {0}")]
    TooLarge(String),

    /// A change is malformed and will never be accepted.
    #[error("validation failed for {key}: {message}")]
    Validation {
        /// The offending change.
        key: ChangeKey,
        /// Details.
        message: String,
    },

    /// Engine and remote disagree on record shapes. Halts the sync loop.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Encoding or decoding error.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Protocol error (unexpected response shape or status).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An operator action named a change that has no outbox row.
    #[error("no queued change for {0}")]
    NotFound(ChangeKey),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The background loop is not running.
    #[error("sync loop is not running")]
    NotRunning,

    /// The background loop is already running.
    #[error("sync loop is already running")]
    AlreadyRunning,

    /// A previous schema mismatch halted syncing until `resume()` is called.
    #[error("sync halted: {0}")]
    Halted(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a validation error.
    pub fn validation(key: ChangeKey, message: impl Into<String>) -> Self {
        Self::Validation {
            key,
            message: message.into(),
        }
    }

    /// True for network-level failures that are retried with exponential backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::NotConnected | SyncError::ServerError(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error can be retried.
    ///
    /// Per-change conflicts are not errors; they travel as
    /// [`ChangeOutcome`](driftsync_protocol::ChangeOutcome) values.
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || matches!(self, SyncError::TooLarge(_))
    }

    /// True for errors that must stop the sync loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::SchemaMismatch(_) | SyncError::Halted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset by peer").is_retryable());
        assert!(!SyncError::transport_fatal("unsupported scheme ftp").is_retryable());
        assert!(SyncError::Timeout.is_transient());
        assert!(SyncError::ServerError("internal error".into()).is_transient());
        let too_large = SyncError::TooLarge("too many changes: 1200 > 1000".into());
        assert!(too_large.is_retryable());
        assert!(!too_large.is_transient());
        assert!(!SyncError::Protocol("HTTP 418".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn fatal_errors() {
        assert!(SyncError::SchemaMismatch("unknown type 'party'".into()).is_fatal());
        assert!(!SyncError::validation(ChangeKey::new("voter", "v1"), "bad").is_fatal());
        assert!(!SyncError::Timeout.is_fatal());
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::NotConnected.to_string(), "not connected to server");

        let err = SyncError::validation(ChangeKey::new("voter", "v1"), "missing name");
        assert_eq!(err.to_string(), "validation failed for voter/v1: missing name");
    }
}
