//! Authentication support for the sync server.
//!
//! This module provides token-based authentication using HMAC-SHA256.
//! Tokens include the issue time for expiration checking.
//!
//! ## Token Format
//!
//! Tokens are composed of:
//! - 8 bytes: issue time (Unix millis, big-endian)
//! - N bytes: device id (UTF-8)
//! - 32 bytes: HMAC-SHA256 signature over the preceding bytes
//!
//! The whole token is hex-encoded and sent as a bearer token.

use crate::error::{ServerError, ServerResult};
use driftsync_protocol::Timestamp;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const ISSUED_LEN: usize = 8;
const SIGNATURE_LEN: usize = 32;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and checks device tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("token_expiry", &self.config.token_expiry)
            .finish_non_exhaustive()
    }
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a token for `device_id`, issued at `issued_at`.
    pub fn create_token(&self, device_id: &str, issued_at: Timestamp) -> ServerResult<String> {
        if device_id.is_empty() {
            return Err(ServerError::InvalidRequest("empty device id".into()));
        }
        let mut data = Vec::with_capacity(ISSUED_LEN + device_id.len() + SIGNATURE_LEN);
        data.extend_from_slice(&issued_at.as_millis().to_be_bytes());
        data.extend_from_slice(device_id.as_bytes());

        let signature = self.mac(&data)?.finalize().into_bytes();
        data.extend_from_slice(&signature);
        Ok(hex::encode(data))
    }

    /// Validates a token and returns the device id it was issued to.
    pub fn validate_token(&self, token: &str, now: Timestamp) -> ServerResult<String> {
        let bytes = hex::decode(token)
            .map_err(|_| ServerError::AuthenticationFailed("malformed token".into()))?;
        if bytes.len() <= ISSUED_LEN + SIGNATURE_LEN {
            return Err(ServerError::AuthenticationFailed(
                "invalid token length".into(),
            ));
        }

        let (data, signature) = bytes.split_at(bytes.len() - SIGNATURE_LEN);
        self.mac(data)?
            .verify_slice(signature)
            .map_err(|_| ServerError::NotAuthorized("invalid signature".into()))?;

        let (issued, device) = data.split_at(ISSUED_LEN);
        let mut issued_bytes = [0u8; ISSUED_LEN];
        issued_bytes.copy_from_slice(issued);
        let issued_at = Timestamp::from_millis(i64::from_be_bytes(issued_bytes));
        if now > issued_at.saturating_add(self.config.token_expiry) {
            return Err(ServerError::NotAuthorized("token expired".into()));
        }

        String::from_utf8(device.to_vec())
            .map_err(|_| ServerError::AuthenticationFailed("malformed device id".into()))
    }

    fn mac(&self, data: &[u8]) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key: {e}")))?;
        mac.update(data);
        Ok(mac)
    }
}
