//! Request handlers for sync endpoints.

use crate::auth::{AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::oplog::{Offer, RemoteStore, State};
use driftsync_protocol::{
    ChangeKey, Clock, ConflictEntry, DependencyConflictEntry, FailedChange, PullRequest,
    PullResponse, PushRequest, PushResponse, RejectReason, Timestamp, TypeOrder, WireChange,
    WireMessage,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Path of the push endpoint.
pub const PUSH_PATH: &str = "/sync/push";
/// Path of the pull endpoint.
pub const PULL_PATH: &str = "/sync/pull";

/// What the server decided for one pushed change.
enum Verdict {
    Stored,
    Replay,
    Conflict(WireChange),
    Missing(Vec<ChangeKey>),
    Rejected(RejectReason),
}

/// Handler for sync requests.
pub struct RequestHandler {
    config: ServerConfig,
    store: Arc<RemoteStore>,
    clock: Arc<dyn Clock>,
    validator: Option<TokenValidator>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(config: ServerConfig, store: Arc<RemoteStore>, clock: Arc<dyn Clock>) -> Self {
        let validator = config.auth_secret.clone().map(|secret| {
            TokenValidator::new(AuthConfig::new(secret).with_expiry(config.token_expiry))
        });
        Self {
            config,
            store,
            clock,
            validator,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Token validator, when a secret is configured.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }

    /// Handles a push request.
    ///
    /// Changes are judged in order under one write lock, so a parent earlier
    /// in the same batch satisfies a child later in it.
    pub fn handle_push(&self, request: &PushRequest) -> ServerResult<PushResponse> {
        if request.changes.len() > self.config.max_push_changes {
            return Err(ServerError::TooLarge {
                count: request.changes.len(),
                max: self.config.max_push_changes,
            });
        }

        let now = self.clock.now();
        let order = &self.config.type_order;
        let response = self.store.write(|state| {
            let mut response = PushResponse::default();
            for change in &request.changes {
                let key = change.key();
                match judge(order, state, change, now) {
                    Verdict::Stored => response.processed_count += 1,
                    Verdict::Replay => debug!(%key, "replayed change acknowledged"),
                    Verdict::Conflict(current) => {
                        debug!(%key, server_updated_at = %current.updated_at, "stale change");
                        response.conflicts.push(ConflictEntry {
                            change: key,
                            server_record: Some(current),
                        });
                    }
                    Verdict::Missing(missing) => {
                        debug!(%key, missing = missing.len(), "parents missing");
                        response
                            .dependency_conflicts
                            .push(DependencyConflictEntry { change: key, missing });
                    }
                    Verdict::Rejected(reason) => {
                        warn!(%key, reason = reason.message(), "change rejected");
                        response.failed_changes.push(FailedChange::new(&key, reason));
                    }
                }
            }
            response.server_timestamp = state.high_water().max(now);
            response
        });

        info!(
            received = request.changes.len(),
            processed = response.processed_count,
            conflicts = response.conflicts.len(),
            dependency_conflicts = response.dependency_conflicts.len(),
            rejected = response.failed_changes.len(),
            "push handled"
        );
        Ok(response)
    }

    /// Handles a pull request.
    ///
    /// `server_timestamp` is the latest storage time handed out, so anything
    /// written after this page is strictly newer than it.
    pub fn handle_pull(&self, request: &PullRequest) -> ServerResult<PullResponse> {
        if request.limit == 0 {
            return Err(ServerError::InvalidRequest("limit must be positive".into()));
        }
        let limit = request.limit.min(self.config.max_pull_page);

        let response = self.store.read(|state| {
            let (changes, has_more) = state.page(request.since, request.offset, limit);
            PullResponse {
                changes,
                server_timestamp: state.high_water(),
                has_more,
            }
        });

        debug!(
            since = %request.since,
            offset = request.offset,
            returned = response.changes.len(),
            has_more = response.has_more,
            "pull handled"
        );
        Ok(response)
    }

    /// Checks the bearer token when authentication is required.
    ///
    /// Returns the authenticated device id, if any.
    pub fn authenticate(&self, bearer: Option<&str>) -> ServerResult<Option<String>> {
        if !self.config.require_auth {
            return Ok(None);
        }
        let validator = self
            .validator
            .as_ref()
            .ok_or_else(|| ServerError::Config("auth required but no secret set".into()))?;
        let token =
            bearer.ok_or_else(|| ServerError::AuthenticationFailed("missing token".into()))?;
        validator
            .validate_token(token, self.clock.now())
            .map(Some)
    }

    /// Routes an HTTP request and returns `(status, body)`.
    ///
    /// `target` is the path plus optional query string. Success bodies are
    /// CBOR; error bodies are the UTF-8 error message.
    pub fn handle_http(
        &self,
        method: &str,
        target: &str,
        body: &[u8],
        bearer: Option<&str>,
    ) -> (u16, Vec<u8>) {
        match self.route(method, target, body, bearer) {
            Ok(bytes) => (200, bytes),
            Err(e) => {
                if e.is_server_error() {
                    warn!(error = %e, target, "request failed");
                } else {
                    debug!(error = %e, target, "request refused");
                }
                (e.status_code(), e.to_string().into_bytes())
            }
        }
    }

    fn route(
        &self,
        method: &str,
        target: &str,
        body: &[u8],
        bearer: Option<&str>,
    ) -> ServerResult<Vec<u8>> {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        if path != PUSH_PATH && path != PULL_PATH {
            return Err(ServerError::NotFound(path.to_string()));
        }
        let device = self.authenticate(bearer)?;
        if let Some(device) = &device {
            debug!(device = %device, path, "authenticated request");
        }

        match (method, path) {
            ("POST", PUSH_PATH) => {
                let request = PushRequest::decode(body)?;
                Ok(self.handle_push(&request)?.encode()?)
            }
            ("GET", PULL_PATH) => {
                let request = PullRequest::from_query(query)?;
                Ok(self.handle_pull(&request)?.encode()?)
            }
            _ => Err(ServerError::MethodNotAllowed(format!("{method} {path}"))),
        }
    }
}

/// Judges one change: schema first, then parents, then last-write-wins.
fn judge(order: &TypeOrder, state: &mut State, change: &WireChange, now: Timestamp) -> Verdict {
    if let Err(violation) = order.validate_change(change) {
        let message = violation.to_string();
        return Verdict::Rejected(if violation.is_unknown_type() {
            RejectReason::SchemaMismatch { message }
        } else {
            RejectReason::Validation { message }
        });
    }
    if change.id.as_str().is_empty() {
        return Verdict::Rejected(RejectReason::Validation {
            message: "empty record id".into(),
        });
    }
    if let Err(e) = change.lifecycle() {
        return Verdict::Rejected(RejectReason::Validation {
            message: e.to_string(),
        });
    }

    if change.deleted_at.is_none() {
        let key = change.key();
        let missing: Vec<ChangeKey> = order
            .references_of(change)
            .into_iter()
            .filter(|parent| *parent != key && !state.contains(parent))
            .collect();
        if !missing.is_empty() {
            return Verdict::Missing(missing);
        }
    }

    match state.offer(change, now) {
        Offer::Stored(_) => Verdict::Stored,
        Offer::Replay => Verdict::Replay,
        Offer::Stale(current) => Verdict::Conflict(current),
    }
}
