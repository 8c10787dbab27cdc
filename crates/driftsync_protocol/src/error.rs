//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or validating protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A value could not be encoded to CBOR.
    #[error("encode error: {0}")]
    Encode(String),

    /// Bytes could not be decoded from CBOR.
    #[error("decode error: {0}")]
    Decode(String),

    /// A change is structurally invalid (e.g. a tombstone without a timestamp).
    #[error("invalid change {key}: {message}")]
    InvalidChange {
        /// `type/id` of the offending change.
        key: String,
        /// What is wrong with it.
        message: String,
    },

    /// A pull query string could not be parsed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The configured type order is unusable (duplicates, forward or cyclic references).
    #[error("invalid type order: {0}")]
    InvalidTypeOrder(String),
}

impl ProtocolError {
    /// Creates an invalid-change error.
    pub fn invalid_change(key: impl ToString, message: impl Into<String>) -> Self {
        Self::InvalidChange {
            key: key.to_string(),
            message: message.into(),
        }
    }
}
