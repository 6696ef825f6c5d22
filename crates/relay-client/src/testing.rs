//! Scripted [`Connector`] for unit tests.
//!
//! POST replies are queued per path suffix (`/queue/join`, `/reset`, ...);
//! streams and sockets are queued in order and handed out as requested.
//! Every request is recorded.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::connector::{Connector, Headers, HttpReply};
use crate::error::{ClientError, ClientResult};
use crate::transport::TransportIterator;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPost {
    pub url: String,
    pub body: Value,
    pub headers: Headers,
}

#[derive(Default)]
pub struct ScriptedConnector {
    replies: Mutex<HashMap<String, VecDeque<ClientResult<HttpReply>>>>,
    streams: Mutex<VecDeque<ClientResult<TransportIterator>>>,
    sockets: Mutex<VecDeque<ClientResult<TransportIterator>>>,
    posts: Mutex<Vec<RecordedPost>>,
    stream_urls: Mutex<Vec<String>>,
    socket_urls: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, path: &str, reply: ClientResult<HttpReply>) {
        self.replies
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn stream(&self, stream: ClientResult<TransportIterator>) {
        self.streams.lock().unwrap().push_back(stream);
    }

    pub fn socket(&self, socket: ClientResult<TransportIterator>) {
        self.sockets.lock().unwrap().push_back(socket);
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().unwrap().clone()
    }

    pub fn posts_to(&self, path: &str) -> Vec<RecordedPost> {
        self.posts()
            .into_iter()
            .filter(|p| url_path(&p.url).ends_with(path))
            .collect()
    }

    pub fn stream_urls(&self) -> Vec<String> {
        self.stream_urls.lock().unwrap().clone()
    }

    pub fn socket_urls(&self) -> Vec<String> {
        self.socket_urls.lock().unwrap().clone()
    }
}

fn url_path(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        headers: &Headers,
    ) -> ClientResult<HttpReply> {
        self.posts.lock().unwrap().push(RecordedPost {
            url: url.to_string(),
            body: body.clone(),
            headers: headers.clone(),
        });

        let path = url_path(url);
        let mut replies = self.replies.lock().unwrap();
        let scripted = replies
            .iter_mut()
            .find(|(suffix, queue)| path.ends_with(suffix.as_str()) && !queue.is_empty())
            .and_then(|(_, queue)| queue.pop_front());
        scripted.unwrap_or_else(|| {
            Err(ClientError::ConnectionFailed(format!("unscripted POST {}", url)))
        })
    }

    async fn get_stream(&self, url: &str, _headers: &Headers) -> ClientResult<TransportIterator> {
        self.stream_urls.lock().unwrap().push(url.to_string());
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ClientError::ConnectionFailed(format!("unscripted stream {}", url)))
            })
    }

    async fn connect_socket(&self, url: &str) -> ClientResult<TransportIterator> {
        self.socket_urls.lock().unwrap().push(url.to_string());
        self.sockets
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ClientError::ConnectionFailed(format!("unscripted socket {}", url)))
            })
    }
}

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
