//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via a trait so that any HTTP library
//! can be plugged in. Bodies are CBOR; pulls are `GET` with the cursor in the
//! query string, pushes are `POST`.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use driftsync_protocol::{PullRequest, PullResponse, PushRequest, PushResponse, WireMessage};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Push endpoint path.
pub const PUSH_PATH: &str = "/sync/push";
/// Pull endpoint path.
pub const PULL_PATH: &str = "/sync/pull";

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET.
    Get,
    /// POST.
    Post,
}

impl HttpMethod {
    /// Returns the method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// An outgoing HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL, query string included.
    pub url: String,
    /// CBOR body (empty for GET).
    pub body: Vec<u8>,
    /// Bearer token for the `Authorization` header.
    pub bearer_token: Option<String>,
}

impl HttpRequest {
    /// Path and query part of the URL (everything from the first `/sync/`).
    pub fn target(&self) -> &str {
        self.url
            .find("/sync/")
            .map(|i| &self.url[i..])
            .unwrap_or(&self.url)
    }
}

/// A received HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body: CBOR on success, a UTF-8 message otherwise.
    pub body: Vec<u8>,
}

/// HTTP client abstraction.
///
/// `Err` means the request never produced a response (DNS, connect, reset);
/// it is treated as a transient network failure.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based sync transport.
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    client: C,
    bearer_token: Option<String>,
    closed: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            bearer_token: None,
            closed: AtomicBool::new(false),
            last_error: RwLock::new(None),
        }
    }

    /// Attaches a bearer token to every request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    async fn exchange<Res: WireMessage>(
        &self,
        method: HttpMethod,
        target: String,
        body: Vec<u8>,
    ) -> SyncResult<Res> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let request = HttpRequest {
            method,
            url: format!("{}{}", self.base_url, target),
            body,
            bearer_token: self.bearer_token.clone(),
        };
        tracing::trace!(method = method.as_str(), url = %request.url, "sending sync request");

        let response = self.client.send(request).await.map_err(|e| {
            *self.last_error.write() = Some(e.clone());
            SyncError::transport_retryable(e)
        })?;

        match status_error(&response) {
            Some(err) => {
                *self.last_error.write() = Some(err.to_string());
                Err(err)
            }
            None => {
                *self.last_error.write() = None;
                Ok(Res::decode(&response.body)?)
            }
        }
    }
}

fn status_error(response: &HttpResponse) -> Option<SyncError> {
    let message = || String::from_utf8_lossy(&response.body).into_owned();
    match response.status {
        200..=299 => None,
        401 | 403 => Some(SyncError::AuthenticationFailed(message())),
        413 => Some(SyncError::TooLarge(message())),
        422 => Some(SyncError::SchemaMismatch(message())),
        408 | 429 => Some(SyncError::transport_retryable(format!(
            "HTTP {}: {}",
            response.status,
            message()
        ))),
        500..=599 => Some(SyncError::ServerError(format!(
            "HTTP {}: {}",
            response.status,
            message()
        ))),
        status => Some(SyncError::Protocol(format!("HTTP {status}: {}", message()))),
    }
}

#[async_trait]
impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        let body = request.encode()?;
        self.exchange(HttpMethod::Post, PUSH_PATH.to_string(), body)
            .await
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        let target = format!("{PULL_PATH}?{}", request.to_query());
        self.exchange(HttpMethod::Get, target, Vec::new()).await
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    async fn close(&self) -> SyncResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a request and returns the response.
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        (**self).handle(request)
    }
}

/// A loopback HTTP client that routes requests directly to a sync server.
///
/// Useful for testing without actual network overhead. Can be switched
/// "offline" to simulate connection failures.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    reachable: AtomicBool,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulates the network going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        Ok(self.server.handle(&request))
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_protocol::Timestamp;
    use parking_lot::Mutex;

    struct TestClient {
        response: Mutex<Option<HttpResponse>>,
        seen: Mutex<Vec<HttpRequest>>,
        healthy: AtomicBool,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                response: Mutex::new(None),
                seen: Mutex::new(Vec::new()),
                healthy: AtomicBool::new(true),
            }
        }

        fn respond(&self, status: u16, body: Vec<u8>) {
            *self.response.lock() = Some(HttpResponse { status, body });
        }
    }

    #[async_trait]
    impl HttpClient for &'static TestClient {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
            self.seen.lock().push(request);
            self.response
                .lock()
                .clone()
                .ok_or_else(|| "no response set".to_string())
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn leak(client: TestClient) -> &'static TestClient {
        Box::leak(Box::new(client))
    }

    #[tokio::test]
    async fn transport_disconnect() {
        let transport = HttpTransport::new("https://sync.example.com/", leak(TestClient::new()));
        assert_eq!(transport.base_url(), "https://sync.example.com");
        assert!(transport.is_connected());

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        let result = transport.push(&PushRequest::default()).await;
        assert!(matches!(result, Err(SyncError::NotConnected)));
    }

    #[tokio::test]
    async fn transport_unhealthy_client() {
        let client = leak(TestClient::new());
        client.healthy.store(false, Ordering::SeqCst);
        let transport = HttpTransport::new("https://sync.example.com", client);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn pull_uses_get_with_query() {
        let client = leak(TestClient::new());
        let page = PullResponse {
            changes: vec![],
            server_timestamp: Timestamp::from_millis(77),
            has_more: false,
        };
        client.respond(200, page.encode().unwrap());

        let transport =
            HttpTransport::new("https://sync.example.com", client).with_bearer_token("tok");
        let response = transport
            .pull(&PullRequest::new(Timestamp::from_millis(5), 100, 200))
            .await
            .unwrap();
        assert_eq!(response, page);

        let seen = client.seen.lock();
        assert_eq!(seen[0].method, HttpMethod::Get);
        assert_eq!(
            seen[0].url,
            "https://sync.example.com/sync/pull?since=5&limit=100&offset=200"
        );
        assert_eq!(seen[0].target(), "/sync/pull?since=5&limit=100&offset=200");
        assert_eq!(seen[0].bearer_token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn status_codes_map_to_errors() {
        let client = leak(TestClient::new());
        let transport = HttpTransport::new("https://sync.example.com", client);

        client.respond(401, b"bad token".to_vec());
        let err = transport.push(&PushRequest::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationFailed(ref m) if m == "bad token"));
        assert_eq!(transport.last_error().as_deref(), Some("authentication failed: bad token"));

        client.respond(503, b"maintenance".to_vec());
        let err = transport.push(&PushRequest::default()).await.unwrap_err();
        assert!(err.is_transient());

        client.respond(413, b"too many changes: 1200 > 1000".to_vec());
        let err = transport.push(&PushRequest::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::TooLarge(_)));

        client.respond(422, b"unknown type".to_vec());
        let err = transport.push(&PushRequest::default()).await.unwrap_err();
        assert!(err.is_fatal());

        client.respond(200, b"\xff\xff".to_vec());
        let err = transport.push(&PushRequest::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Codec(_)));
    }

    #[tokio::test]
    async fn client_failure_is_transient() {
        let transport = HttpTransport::new("https://sync.example.com", leak(TestClient::new()));
        let err = transport.push(&PushRequest::default()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(transport.last_error().as_deref(), Some("no response set"));
    }
}
