//! # Elevated-Compute Authorization
//!
//! Functions that run on shared accelerators need short-lived headers that
//! only an embedding parent can hand out. The client asks for them right
//! before joining the queue.
//!
//! ```text
//! dependency.zerogpu ─┐
//! app.space_id set ───┤
//! parent installed ───┼──► parent.request_headers("zerogpu-headers")
//! origin matches ─────┘          │
//!                                ├── Ok(headers) ──► attach to /queue/join
//!  any condition false ──────────┴── Err(_)      ──► join without headers
//! ```

use async_trait::async_trait;
use relay_core::{AppConfig, Dependency};
use tracing::debug;

use crate::connector::Headers;
use crate::error::ClientResult;

/// Message kind sent to the parent to request accelerator headers.
pub const ELEVATED_HEADERS_REQUEST: &str = "zerogpu-headers";

/// An embedding parent reachable by message passing.
#[async_trait]
pub trait ParentFrame: Send + Sync {
    /// Origin the parent reports, if known.
    fn origin(&self) -> Option<String>;

    /// Asks the parent for headers of the given kind.
    async fn request_headers(&self, kind: &str) -> ClientResult<Headers>;
}

/// Resolves the headers to attach to a queue join, or none.
///
/// Every failure path degrades silently to no headers.
pub async fn elevated_headers(
    parent: Option<&dyn ParentFrame>,
    authorized_origin: &str,
    app: &AppConfig,
    dependency: &Dependency,
) -> Headers {
    if !dependency.requires_elevated_compute() || app.space_id.is_none() {
        return Headers::new();
    }

    let Some(parent) = parent else {
        return Headers::new();
    };

    match parent.origin() {
        Some(origin) if origin == authorized_origin => {}
        other => {
            debug!(origin = ?other, "Parent origin not authorized, skipping elevated headers");
            return Headers::new();
        }
    }

    match parent.request_headers(ELEVATED_HEADERS_REQUEST).await {
        Ok(headers) => headers,
        Err(e) => {
            debug!(error = %e, "Parent did not provide elevated headers");
            Headers::new()
        }
    }
}
