//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::RequestHandler;
use crate::oplog::RemoteStore;
use driftsync_protocol::{
    ChangeKey, Clock, PullRequest, PullResponse, PushRequest, PushResponse, SystemClock,
    WireChange,
};
use std::sync::Arc;
use tracing::info;

/// The sync server.
///
/// Holds the remote store and answers push and pull requests. It has no
/// socket of its own: an HTTP front end (or a test loopback) passes each
/// request to [`SyncServer::handle_http`].
///
/// # Example
///
/// ```
/// use driftsync_protocol::{RecordSchema, TypeOrder};
/// use driftsync_server::{ServerConfig, SyncServer};
///
/// let order = TypeOrder::new(vec![RecordSchema::new("event")]).unwrap();
/// let server = SyncServer::new(ServerConfig::new(order)).unwrap();
/// let (status, _body) = server.handle_http("GET", "/sync/pull?since=0&limit=10", &[], None);
/// assert_eq!(status, 200);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    store: Arc<RemoteStore>,
    clock: Arc<dyn Clock>,
}

impl SyncServer {
    /// Creates a new sync server using the system clock.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a sync server with an injected clock.
    pub fn with_clock(config: ServerConfig, clock: Arc<dyn Clock>) -> ServerResult<Self> {
        Self::with_store(config, Arc::new(RemoteStore::new()), clock)
    }

    /// Creates a sync server over an existing store.
    pub fn with_store(
        config: ServerConfig,
        store: Arc<RemoteStore>,
        clock: Arc<dyn Clock>,
    ) -> ServerResult<Self> {
        config.validate()?;
        info!(
            types = config.type_order.schemas().len(),
            require_auth = config.require_auth,
            "sync server ready"
        );
        let handler = RequestHandler::new(config, Arc::clone(&store), Arc::clone(&clock));
        Ok(Self {
            handler,
            store,
            clock,
        })
    }

    /// Handles a push request.
    pub fn handle_push(&self, request: &PushRequest) -> ServerResult<PushResponse> {
        self.handler.handle_push(request)
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: &PullRequest) -> ServerResult<PullResponse> {
        self.handler.handle_pull(request)
    }

    /// Handles a raw HTTP request; see [`RequestHandler::handle_http`].
    pub fn handle_http(
        &self,
        method: &str,
        target: &str,
        body: &[u8],
        bearer: Option<&str>,
    ) -> (u16, Vec<u8>) {
        self.handler.handle_http(method, target, body, bearer)
    }

    /// Issues a device token valid from now.
    pub fn issue_token(&self, device_id: &str) -> ServerResult<String> {
        let validator = self
            .handler
            .validator()
            .ok_or_else(|| ServerError::Config("no auth secret configured".into()))?;
        validator.create_token(device_id, self.clock.now())
    }

    /// Writes a change directly into the store, bypassing validation.
    pub fn seed(&self, change: &WireChange) -> bool {
        self.store.seed(change, self.clock.as_ref())
    }

    /// Current server value of a record.
    pub fn record(&self, key: &ChangeKey) -> Option<WireChange> {
        self.store.get(key)
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<RemoteStore> {
        &self.store
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        self.handler.config()
    }
}
