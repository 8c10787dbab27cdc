//! Error types for the sync server.

use driftsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or malformed credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Credentials were understood but refused.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// A push carried more changes than the server accepts at once.
    #[error("too many changes: {count} > {max}")]
    TooLarge {
        /// Changes in the request.
        count: usize,
        /// Configured maximum.
        max: usize,
    },

    /// No route for the request path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The route exists but not for this method.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// Body could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::NotAuthorized(_)
                | ServerError::TooLarge { .. }
                | ServerError::NotFound(_)
                | ServerError::MethodNotAllowed(_)
                | ServerError::Codec(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Config(_) | ServerError::Internal(_))
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Codec(_) => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::NotAuthorized(_) => 403,
            ServerError::NotFound(_) => 404,
            ServerError::MethodNotAllowed(_) => 405,
            ServerError::TooLarge { .. } => 413,
            ServerError::Config(_) | ServerError::Internal(_) => 500,
        }
    }
}
