//! JSON transport to the remote store.

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use url::Url;

use fitsync_common::{Error, Result};

use crate::config::SyncConfig;

/// A completed request: status code and parsed body.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    /// HTTP status code.
    pub status: u16,
    /// JSON body; non-JSON bodies are kept as a string, empty ones as null.
    pub body: Value,
}

impl RemoteResponse {
    /// Response with an arbitrary status.
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// `200 OK` with a body.
    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    /// `404 Not Found` without a body.
    pub fn not_found() -> Self {
        Self::new(404, Value::Null)
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the remote reported "nothing found".
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

/// Performs JSON requests against the remote store.
///
/// An `Err` always means the request did not complete (network category);
/// any answer from the server, including error statuses, is a `RemoteResponse`.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// `GET path?query`.
    async fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<RemoteResponse>;

    /// `POST path` with a JSON body.
    async fn post_json(&self, path: &str, body: &Value) -> Result<RemoteResponse>;
}

/// HTTP transport over `reqwest`.
pub struct HttpTransport {
    http: Client,
    base: Url,
    auth_token: Option<String>,
}

impl HttpTransport {
    /// Create a transport for the configured server.
    ///
    /// # Errors
    /// - Server URL cannot be parsed
    /// - HTTP client cannot be built
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let mut server = config.server_url.trim().to_string();
        if !server.ends_with('/') {
            server.push('/');
        }
        let base = Url::parse(&server)
            .map_err(|e| Error::InvalidInput(format!("Invalid server URL {}: {}", server, e)))?;
        let http = Client::builder()
            .user_agent(concat!("fitsync/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            auth_token: config.auth_token.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", path, e)))
    }

    async fn send(&self, request: RequestBuilder) -> Result<RemoteResponse> {
        let request = match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(e.to_string())
                } else {
                    Error::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(e.to_string())
            } else {
                Error::Network(format!("Failed to read response: {}", e))
            }
        })?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(RemoteResponse { status, body })
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<RemoteResponse> {
        let url = self.url(path)?;
        debug!("GET {}", url);
        self.send(self.http.get(url).query(query)).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<RemoteResponse> {
        let url = self.url(path)?;
        debug!("POST {}", url);
        self.send(self.http.post(url).json(body)).await
    }
}

/// Request method recorded by [`MockTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

/// A request seen by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// Scripted reply of [`MockTransport`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with a response.
    Respond(RemoteResponse),
    /// Fail as if the connection dropped.
    NetworkError(String),
    /// Fail as if the request timed out.
    Timeout,
}

impl From<RemoteResponse> for MockReply {
    fn from(response: RemoteResponse) -> Self {
        MockReply::Respond(response)
    }
}

#[derive(Debug, Default)]
struct MockState {
    queued: HashMap<(Method, String), VecDeque<MockReply>>,
    fallback: HashMap<(Method, String), MockReply>,
    calls: Vec<RecordedCall>,
    disconnected: bool,
    latency: Option<Duration>,
}

/// In-memory transport for tests.
///
/// Replies are scripted per endpoint: queued replies are consumed first, then
/// the sticky reply set with [`MockTransport::respond_with`]; an unscripted
/// endpoint answers `404`.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Create a connected mock without any script.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a one-shot reply for an endpoint.
    pub fn enqueue(&self, method: Method, path: &str, reply: impl Into<MockReply>) {
        self.state()
            .queued
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply.into());
    }

    /// Reply used whenever the endpoint's queue is empty.
    pub fn respond_with(&self, method: Method, path: &str, reply: impl Into<MockReply>) {
        self.state()
            .fallback
            .insert((method, path.to_string()), reply.into());
    }

    /// Simulate losing or regaining the connection.
    pub fn set_connected(&self, connected: bool) {
        self.state().disconnected = !connected;
    }

    /// Delay every reply.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// Every request seen so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    /// Number of requests seen so far.
    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Requests seen for one endpoint.
    pub fn calls_to(&self, method: Method, path: &str) -> Vec<RecordedCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .cloned()
            .collect()
    }

    async fn handle(&self, call: RecordedCall) -> Result<RemoteResponse> {
        let (reply, latency) = {
            let mut state = self.state();
            let key = (call.method, call.path.clone());
            state.calls.push(call);
            let reply = if state.disconnected {
                MockReply::NetworkError("Network is unreachable".to_string())
            } else {
                let queued = state.queued.get_mut(&key).and_then(VecDeque::pop_front);
                match queued {
                    Some(reply) => reply,
                    None => state
                        .fallback
                        .get(&key)
                        .cloned()
                        .unwrap_or_else(|| MockReply::Respond(RemoteResponse::not_found())),
                }
            };
            (reply, state.latency)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match reply {
            MockReply::Respond(response) => Ok(response),
            MockReply::NetworkError(message) => Err(Error::Network(message)),
            MockReply::Timeout => Err(Error::Timeout("Mock request timed out".to_string())),
        }
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<RemoteResponse> {
        self.handle(RecordedCall {
            method: Method::Get,
            path: path.to_string(),
            query: query.to_vec(),
            body: None,
        })
        .await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<RemoteResponse> {
        self.handle(RecordedCall {
            method: Method::Post,
            path: path.to_string(),
            query: Vec::new(),
            body: Some(body.clone()),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_queue_then_fallback() {
        let mock = MockTransport::new();
        mock.enqueue(Method::Get, "sync/pull", RemoteResponse::ok(json!({ "n": 1 })));
        mock.respond_with(Method::Get, "sync/pull", RemoteResponse::ok(json!({ "n": 2 })));

        let first = mock.get_json("sync/pull", &[]).await.unwrap();
        let second = mock.get_json("sync/pull", &[]).await.unwrap();
        let third = mock.get_json("sync/pull", &[]).await.unwrap();
        assert_eq!(first.body, json!({ "n": 1 }));
        assert_eq!(second.body, json!({ "n": 2 }));
        assert_eq!(third.body, json!({ "n": 2 }));

        let unscripted = mock.post_json("sync/push", &json!({})).await.unwrap();
        assert!(unscripted.is_not_found());
        assert_eq!(mock.call_count(), 4);
        assert_eq!(mock.calls_to(Method::Post, "sync/push").len(), 1);
    }

    #[tokio::test]
    async fn test_mock_disconnected_and_timeout() {
        let mock = MockTransport::new();
        mock.set_connected(false);
        let err = mock.get_json("sync/pull", &[]).await.unwrap_err();
        assert!(err.is_network());

        mock.set_connected(true);
        mock.enqueue(Method::Get, "sync/pull", MockReply::Timeout);
        let err = mock.get_json("sync/pull", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_http_transport_joins_paths() {
        let config = SyncConfig::default().with_server_url("https://api.example.com/v1");
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(
            transport.url("/sync/pull").unwrap().as_str(),
            "https://api.example.com/v1/sync/pull"
        );
    }

    #[test]
    fn test_http_transport_rejects_bad_url() {
        let config = SyncConfig::default().with_server_url("not a url");
        assert!(matches!(
            HttpTransport::new(&config),
            Err(Error::InvalidInput(_))
        ));
    }
}
