//! # Endpoints & App Configuration
//!
//! Types supplied by the external config/schema resolvers, and the lookup
//! that turns a caller's endpoint reference into a function index.
//!
//! ## Resolution Rules
//! ```text
//! submit(3, ..)          ──► fn_index 3 if the app declares dependency 3
//! submit("/predict", ..) ──► trim, strip one leading '/', look up api_map
//! submit(" predict ", ..)──► "predict" ──► api_map["predict"]
//! anything else          ──► CoreError::UnknownEndpoint (before any I/O)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::protocol::Protocol;

// =============================================================================
// App Configuration
// =============================================================================

/// Resolved application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root URL of the app server (`https://host/path`).
    pub root: String,

    /// Dialect the server speaks.
    #[serde(default)]
    pub protocol: Protocol,

    /// One entry per callable function, indexed by fn_index.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// App-wide queue default for functions that don't set their own.
    #[serde(default = "default_true")]
    pub enable_queue: bool,

    /// Hosting space, present when the app runs on shared infrastructure.
    #[serde(default)]
    pub space_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Creates a config for `root` speaking `protocol` with no dependencies.
    pub fn new(root: impl Into<String>, protocol: Protocol) -> Self {
        AppConfig {
            root: root.into().trim_end_matches('/').to_string(),
            protocol,
            dependencies: Vec::new(),
            enable_queue: true,
            space_id: None,
        }
    }

    /// Returns true if `fn_index` bypasses the queue.
    ///
    /// A function's own `queue` flag wins; unset falls back to the app
    /// default.
    pub fn is_skip_queue(&self, fn_index: usize) -> bool {
        let queued = self
            .dependencies
            .get(fn_index)
            .and_then(|d| d.queue)
            .unwrap_or(self.enable_queue);
        !queued
    }
}

/// Per-function dependency metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    /// Explicit queue policy; `None` defers to the app default.
    #[serde(default)]
    pub queue: Option<bool>,

    /// Requires shared-accelerator (elevated compute) authorization.
    #[serde(default)]
    pub zerogpu: Option<bool>,
}

impl Dependency {
    pub fn requires_elevated_compute(&self) -> bool {
        self.zerogpu.unwrap_or(false)
    }
}

// =============================================================================
// API Schema
// =============================================================================

/// Declared input/output schema of one endpoint. Opaque to this crate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointInfo {
    #[serde(default)]
    pub parameters: Vec<Value>,

    #[serde(default)]
    pub returns: Vec<Value>,
}

/// API description from the schema resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiInfo {
    /// Keyed by route, e.g. `"/predict"`.
    #[serde(default)]
    pub named_endpoints: HashMap<String, EndpointInfo>,

    /// Keyed by fn_index.
    #[serde(default)]
    pub unnamed_endpoints: HashMap<String, EndpointInfo>,

    /// Route name without leading slash → fn_index.
    #[serde(default)]
    pub api_map: HashMap<String, usize>,
}

// =============================================================================
// Endpoint Reference & Resolution
// =============================================================================

/// How a caller names the function to invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointRef {
    Index(usize),
    Name(String),
}

impl From<usize> for EndpointRef {
    fn from(index: usize) -> Self {
        EndpointRef::Index(index)
    }
}

impl From<&str> for EndpointRef {
    fn from(name: &str) -> Self {
        EndpointRef::Name(name.to_string())
    }
}

impl From<String> for EndpointRef {
    fn from(name: String) -> Self {
        EndpointRef::Name(name)
    }
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRef::Index(i) => write!(f, "fn_index {}", i),
            EndpointRef::Name(n) => write!(f, "{}", n),
        }
    }
}

/// Immutable result of a successful lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEndpoint {
    pub fn_index: usize,

    /// Route reported on events; numeric lookups report `/predict`.
    pub route: String,

    pub dependency: Dependency,
}

/// Resolves `endpoint` against the app's API map and dependencies.
pub fn resolve_endpoint(
    endpoint: &EndpointRef,
    api: &ApiInfo,
    config: &AppConfig,
) -> CoreResult<ResolvedEndpoint> {
    let (fn_index, route) = match endpoint {
        EndpointRef::Index(index) => {
            if *index >= config.dependencies.len() {
                return Err(CoreError::UnknownEndpoint(endpoint.to_string()));
            }
            (*index, "/predict".to_string())
        }
        EndpointRef::Name(name) => {
            let trimmed = name.trim();
            let bare = trimmed.strip_prefix('/').unwrap_or(trimmed);
            let fn_index = *api
                .api_map
                .get(bare)
                .ok_or_else(|| CoreError::UnknownEndpoint(name.clone()))?;
            (fn_index, format!("/{}", bare))
        }
    };

    let dependency = config.dependencies.get(fn_index).cloned().unwrap_or_default();

    Ok(ResolvedEndpoint {
        fn_index,
        route,
        dependency,
    })
}

// =============================================================================
// Submission Payload
// =============================================================================

/// Body sent to the server when a submission joins or pushes its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub data: Vec<Value>,
    pub event_data: Option<Value>,
    pub fn_index: usize,
    pub trigger_id: Option<u64>,
}

impl Payload {
    /// `{...payload, session_hash}`
    pub fn with_session(&self, session_hash: &str) -> Value {
        json!({
            "data": self.data,
            "event_data": self.event_data,
            "fn_index": self.fn_index,
            "trigger_id": self.trigger_id,
            "session_hash": session_hash,
        })
    }

    /// `{...payload, session_hash, event_id}`
    pub fn with_event(&self, session_hash: &str, event_id: &str) -> Value {
        let mut body = self.with_session(session_hash);
        body["event_id"] = Value::String(event_id.to_string());
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (ApiInfo, AppConfig) {
        let mut api = ApiInfo::default();
        api.api_map.insert("predict".into(), 0);
        api.api_map.insert("chat".into(), 1);
        api.named_endpoints.insert("/predict".into(), EndpointInfo::default());

        let mut config = AppConfig::new("http://localhost:7860/", Protocol::SseV2);
        config.dependencies = vec![
            Dependency::default(),
            Dependency {
                queue: Some(false),
                zerogpu: Some(true),
            },
        ];
        (api, config)
    }

    #[test]
    fn test_resolve_by_name_variants() {
        let (api, config) = fixture();
        for name in ["predict", "/predict", "  /predict  "] {
            let resolved = resolve_endpoint(&name.into(), &api, &config).unwrap();
            assert_eq!(resolved.fn_index, 0);
            assert_eq!(resolved.route, "/predict");
        }
    }

    #[test]
    fn test_resolve_by_index() {
        let (api, config) = fixture();
        let resolved = resolve_endpoint(&1usize.into(), &api, &config).unwrap();
        assert_eq!(resolved.fn_index, 1);
        assert_eq!(resolved.route, "/predict");
        assert!(resolved.dependency.requires_elevated_compute());
    }

    #[test]
    fn test_unknown_endpoint() {
        let (api, config) = fixture();
        assert!(matches!(
            resolve_endpoint(&"/missing".into(), &api, &config),
            Err(CoreError::UnknownEndpoint(_))
        ));
        assert!(matches!(
            resolve_endpoint(&9usize.into(), &api, &config),
            Err(CoreError::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn test_skip_queue_policy() {
        let (_, mut config) = fixture();
        assert!(!config.is_skip_queue(0));
        assert!(config.is_skip_queue(1));

        config.enable_queue = false;
        assert!(config.is_skip_queue(0));
        assert!(config.is_skip_queue(5));
    }

    #[test]
    fn test_root_trailing_slash_is_trimmed() {
        let (_, config) = fixture();
        assert_eq!(config.root, "http://localhost:7860");
    }

    #[test]
    fn test_payload_bodies() {
        let payload = Payload {
            data: vec![Value::from("hi")],
            event_data: None,
            fn_index: 0,
            trigger_id: Some(4),
        };
        let body = payload.with_event("sess", "evt");
        assert_eq!(body["session_hash"], "sess");
        assert_eq!(body["event_id"], "evt");
        assert_eq!(body["data"][0], "hi");
        assert_eq!(body["trigger_id"], 4);
    }
}
