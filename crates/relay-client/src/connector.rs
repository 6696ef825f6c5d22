//! # Connector
//!
//! The only place the client reaches the network. Everything above this
//! seam talks in [`HttpReply`]s and [`TransportIterator`]s, so submissions
//! can be driven by a scripted connector in tests.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Connector              used for                                        │
//! │  ─────────────────────  ──────────────────────────────────────────────  │
//! │  post_json              /queue/join (v1+), /queue/data (v0), /reset,    │
//! │                         /run/{name}                                     │
//! │  get_stream             /queue/join (v0), /queue/data (v1+)             │
//! │  connect_socket         /queue/join (ws)                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::transport::{socket, sse, TransportIterator};

/// Extra request headers as name/value pairs.
pub type Headers = Vec<(String, String)>;

/// Status and decoded JSON body of a POST.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,

    /// `Value::Null` when the body is empty or not JSON.
    pub body: Value,
}

impl HttpReply {
    pub fn new(status: u16, body: Value) -> Self {
        HttpReply { status, body }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Transport boundary.
#[async_trait]
pub trait Connector: Send + Sync {
    /// POSTs a JSON body. Non-2xx statuses are returned, not raised.
    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        headers: &Headers,
    ) -> ClientResult<HttpReply>;

    /// Opens an event stream.
    async fn get_stream(&self, url: &str, headers: &Headers) -> ClientResult<TransportIterator>;

    /// Opens a full-duplex socket.
    async fn connect_socket(&self, url: &str) -> ClientResult<TransportIterator>;
}

// =============================================================================
// HTTP Connector
// =============================================================================

/// Default connector backed by reqwest and tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    http: reqwest::Client,
    token: Option<String>,
}

impl HttpConnector {
    /// Creates a connector that sends `token` as a bearer credential.
    pub fn new(token: Option<String>) -> Self {
        HttpConnector {
            http: reqwest::Client::new(),
            token,
        }
    }

    fn authorize(
        &self,
        mut request: reqwest::RequestBuilder,
        headers: &Headers,
    ) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        headers: &Headers,
    ) -> ClientResult<HttpReply> {
        let request = self.authorize(self.http.post(url).json(body), headers);
        let response = request.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        debug!(%url, status, "POST complete");
        Ok(HttpReply { status, body })
    }

    async fn get_stream(&self, url: &str, headers: &Headers) -> ClientResult<TransportIterator> {
        let request = self
            .authorize(self.http.get(url), headers)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(ClientError::ConnectionFailed(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        debug!(%url, "Event stream opened");
        Ok(sse::spawn_body(response))
    }

    async fn connect_socket(&self, url: &str) -> ClientResult<TransportIterator> {
        socket::connect(url).await
    }
}
