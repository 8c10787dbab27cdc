//! Error types for the local store.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or writing the local store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The snapshot could not be encoded.
    #[error("snapshot encode error: {0}")]
    Encode(String),

    /// The snapshot on disk could not be decoded.
    #[error("snapshot decode error: {0}")]
    Decode(String),

    /// The snapshot was written by an unknown format version.
    #[error("unsupported snapshot format version {0}")]
    UnsupportedFormat(u32),

    /// Another process holds the store's lock file.
    #[error("store is locked by another process: {}", .0.display())]
    Locked(PathBuf),

    /// The store does not exist and `create_if_missing` is off.
    #[error("store not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A transaction was aborted by its caller.
    #[error("transaction aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

impl StoreError {
    /// Creates an aborted-transaction error.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }
}
