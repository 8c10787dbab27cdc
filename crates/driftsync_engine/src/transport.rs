//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use driftsync_protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A sync transport handles network communication with the sync server.
///
/// This trait abstracts the network layer, allowing for different implementations
/// (HTTP, in-process, mock for testing, etc.).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Pushes one batch of changes.
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Pulls one page of changes.
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    async fn close(&self) -> SyncResult<()>;
}

/// Runs a network call under a deadline. Expiry maps to [`SyncError::Timeout`].
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout),
    }
}

/// A scripted transport for testing.
///
/// Responses are queued and handed out in order; every request is recorded.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    push_responses: Mutex<VecDeque<SyncResult<PushResponse>>>,
    pull_responses: Mutex<VecDeque<SyncResult<PullResponse>>>,
    pushed: Mutex<Vec<PushRequest>>,
    pulled: Mutex<Vec<PullRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Queues a push response.
    pub fn queue_push_response(&self, response: PushResponse) {
        self.push_responses.lock().push_back(Ok(response));
    }

    /// Queues a push failure.
    pub fn queue_push_error(&self, error: SyncError) {
        self.push_responses.lock().push_back(Err(error));
    }

    /// Queues a pull response.
    pub fn queue_pull_response(&self, response: PullResponse) {
        self.pull_responses.lock().push_back(Ok(response));
    }

    /// Queues a pull failure.
    pub fn queue_pull_error(&self, error: SyncError) {
        self.pull_responses.lock().push_back(Err(error));
    }

    /// Makes every call sleep before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Push requests received so far.
    pub fn pushed(&self) -> Vec<PushRequest> {
        self.pushed.lock().clone()
    }

    /// Pull requests received so far.
    pub fn pulled(&self) -> Vec<PullRequest> {
        self.pulled.lock().clone()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.pushed.lock().push(request.clone());
        self.pause().await;
        self.push_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Protocol("no mock push response queued".into())))
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.pulled.lock().push(*request);
        self.pause().await;
        self.pull_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Protocol("no mock pull response queued".into())))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
