//! # Client
//!
//! One [`Client`] is one session with one app server: a session hash, the
//! resolved app configuration, and the shared event stream used by
//! dialects v1–v3.
//!
//! ## Usage
//! ```rust,ignore
//! let client = Client::builder(app_config, api_info).build()?;
//!
//! let mut submission = client.submit("/predict", vec![json!("hi")], None, None)?;
//! while let Some(event) = submission.next().await {
//!     println!("{:?}", event);
//! }
//!
//! // or, when only the result matters
//! let data = client.predict("/predict", vec![json!("hi")]).await?;
//! ```

use std::sync::Arc;

use relay_core::{
    resolve_endpoint, ApiInfo, AppConfig, EndpointRef, Stage, Status, SubmissionEvent,
    QUEUE_FULL_MSG, UNEXPECTED_ERROR_MSG,
};
use serde_json::Value;
use tracing::info;
use url::Url;

use crate::authorization::ParentFrame;
use crate::config::ClientConfig;
use crate::connector::{Connector, HttpConnector};
use crate::error::{ClientError, ClientResult};
use crate::session::StreamSession;
use crate::submit::Submission;

// =============================================================================
// Shared Client State
// =============================================================================

/// State shared by a client and every submission it spawned.
pub(crate) struct ClientInner {
    pub(crate) app: AppConfig,
    pub(crate) api: ApiInfo,
    pub(crate) config: ClientConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) parent: Option<Arc<dyn ParentFrame>>,
    pub(crate) session: StreamSession,
    ws_root: String,
}

impl ClientInner {
    pub(crate) fn session_hash(&self) -> &str {
        self.config.session_hash()
    }

    /// `__sign` query parameter when a signed token is configured.
    pub(crate) fn sign_params(&self) -> Vec<(&'static str, String)> {
        self.config
            .jwt()
            .map(|jwt| vec![("__sign", jwt.to_string())])
            .unwrap_or_default()
    }

    pub(crate) fn http_url(&self, path: &str, params: &[(&str, String)]) -> ClientResult<String> {
        build_url(&self.app.root, path, params)
    }

    pub(crate) fn ws_url(&self, path: &str, params: &[(&str, String)]) -> ClientResult<String> {
        build_url(&self.ws_root, path, params)
    }
}

fn build_url(root: &str, path: &str, params: &[(&str, String)]) -> ClientResult<String> {
    let mut url = Url::parse(&format!("{}{}", root, path))?;
    if !params.is_empty() {
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
    }
    Ok(url.to_string())
}

fn socket_root(root: &str) -> ClientResult<String> {
    if let Some(rest) = root.strip_prefix("https://") {
        Ok(format!("wss://{}", rest))
    } else if let Some(rest) = root.strip_prefix("http://") {
        Ok(format!("ws://{}", rest))
    } else {
        Err(ClientError::InvalidUrl(format!(
            "App root must start with http:// or https://, got: {}",
            root
        )))
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builds a [`Client`].
pub struct ClientBuilder {
    app: AppConfig,
    api: ApiInfo,
    config: Option<ClientConfig>,
    connector: Option<Arc<dyn Connector>>,
    parent: Option<Arc<dyn ParentFrame>>,
}

impl ClientBuilder {
    /// Client settings; defaults to [`ClientConfig::load_or_default`].
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replaces the default reqwest/tungstenite connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Installs the embedding parent used for elevated-compute headers.
    pub fn parent_frame(mut self, parent: Arc<dyn ParentFrame>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn build(self) -> ClientResult<Client> {
        let config = match self.config {
            Some(config) => config,
            None => ClientConfig::load_or_default(None),
        };
        config.validate()?;

        let mut app = self.app;
        app.root = app.root.trim_end_matches('/').to_string();
        Url::parse(&app.root)?;
        let ws_root = socket_root(&app.root)?;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(HttpConnector::new(config.auth.token.clone())));

        let mut params = vec![("session_hash", config.session_hash().to_string())];
        if let Some(jwt) = config.jwt() {
            params.push(("__sign", jwt.to_string()));
        }
        let stream_url = build_url(&app.root, "/queue/data", &params)?;
        let session = StreamSession::new(connector.clone(), stream_url, app.protocol);

        info!(
            root = %app.root,
            protocol = %app.protocol,
            session_hash = %config.session_hash(),
            "Client ready"
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                app,
                api: self.api,
                config,
                connector,
                parent: self.parent,
                session,
                ws_root,
            }),
        })
    }
}

// =============================================================================
// Client
// =============================================================================

/// A session with one app server.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(app: AppConfig, api: ApiInfo) -> ClientBuilder {
        ClientBuilder {
            app,
            api,
            config: None,
            connector: None,
            parent: None,
        }
    }

    pub fn session_hash(&self) -> &str {
        self.inner.session_hash()
    }

    pub fn app_config(&self) -> &AppConfig {
        &self.inner.app
    }

    /// Starts a submission.
    ///
    /// Fails with `UnknownEndpoint` before any network activity if the
    /// endpoint does not resolve. Nothing is sent until the first `next()`.
    pub fn submit(
        &self,
        endpoint: impl Into<EndpointRef>,
        inputs: Vec<Value>,
        event_data: Option<Value>,
        trigger_id: Option<u64>,
    ) -> ClientResult<Submission> {
        let endpoint = endpoint.into();
        let resolved = resolve_endpoint(&endpoint, &self.inner.api, &self.inner.app)?;
        Ok(Submission::new(self.inner.clone(), resolved, inputs, event_data, trigger_id))
    }

    /// Runs a submission to completion and returns its final data.
    pub async fn predict(
        &self,
        endpoint: impl Into<EndpointRef>,
        inputs: Vec<Value>,
    ) -> ClientResult<Vec<Value>> {
        let mut submission = self.submit(endpoint, inputs, None, None)?;
        let mut data = None;

        while let Some(event) = submission.next().await {
            match event {
                SubmissionEvent::Data(event) => data = Some(event.data),
                SubmissionEvent::Status(event) if event.status.stage == Stage::Complete => {
                    return Ok(data.unwrap_or_default());
                }
                SubmissionEvent::Status(event) if event.status.stage == Stage::Error => {
                    return Err(status_error(&event.status));
                }
                _ => {}
            }
        }

        data.ok_or(ClientError::BrokenConnection)
    }
}

/// Maps a terminal error status to the matching client error.
fn status_error(status: &Status) -> ClientError {
    if status.broken {
        return ClientError::BrokenConnection;
    }
    match status.message.as_deref() {
        Some(QUEUE_FULL_MSG) => ClientError::QueueFull,
        Some(message) => ClientError::Submission {
            message: message.to_string(),
        },
        None => ClientError::Submission {
            message: UNEXPECTED_ERROR_MSG.to_string(),
        },
    }
}
