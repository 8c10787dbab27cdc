//! Server configuration.

use crate::error::{ServerError, ServerResult};
use driftsync_protocol::TypeOrder;
use serde::Deserialize;
use std::time::Duration;

/// Configuration for the sync server.
///
/// Loadable from JSON; `token_expiry` is given in seconds as
/// `token_expiry_secs`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Upper bound on changes returned by one pull page.
    pub max_pull_page: u32,
    /// Upper bound on changes accepted by one push.
    pub max_push_changes: usize,
    /// Whether to require authentication.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// Token lifetime.
    #[serde(rename = "token_expiry_secs", deserialize_with = "secs")]
    pub token_expiry: Duration,
    /// Record types the server understands.
    pub type_order: TypeOrder,
}

fn secs<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

impl ServerConfig {
    /// Creates a configuration accepting the given record types.
    pub fn new(type_order: TypeOrder) -> Self {
        Self {
            type_order,
            ..Self::default()
        }
    }

    /// Parses a JSON configuration.
    pub fn from_json(json: &str) -> ServerResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the maximum pull page size.
    pub fn with_max_pull_page(mut self, size: u32) -> Self {
        self.max_pull_page = size;
        self
    }

    /// Sets the maximum number of changes per push.
    pub fn with_max_push_changes(mut self, count: usize) -> Self {
        self.max_push_changes = count;
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Checks limits and auth settings.
    pub fn validate(&self) -> ServerResult<()> {
        if self.max_pull_page == 0 {
            return Err(ServerError::Config("max_pull_page must be positive".into()));
        }
        if self.max_push_changes == 0 {
            return Err(ServerError::Config(
                "max_push_changes must be positive".into(),
            ));
        }
        if self.require_auth && self.auth_secret.as_ref().map_or(true, Vec::is_empty) {
            return Err(ServerError::Config(
                "require_auth needs a non-empty auth_secret".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_pull_page: 500,
            max_push_changes: 1000,
            require_auth: false,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
            type_order: TypeOrder::default(),
        }
    }
}
