//! # relay-core: Pure Protocol Logic for Relay
//!
//! This crate holds everything about the queue protocol that can be decided
//! without touching a socket: frame normalization, diff reconstruction,
//! endpoint lookup and the events consumers see.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Relay Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Caller                                       │   │
//! │  │    client.submit("/predict", ["hi"]) ──► next().await ...       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               relay-client (I/O)                                │   │
//! │  │    Submission ──► StreamSession ──► TransportIterator          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ relay-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐       │   │
//! │  │   │ protocol │  │ message  │  │ adapter  │  │   diff   │       │   │
//! │  │   │ dialects │  │ frames   │  │ per      │  │ edits    │       │   │
//! │  │   │          │  │ status   │  │ dialect  │  │ accum.   │       │   │
//! │  │   └──────────┘  └──────────┘  └──────────┘  └──────────┘       │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO TASKS                                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - The six wire dialects and their capabilities
//! - [`message`] - Raw frames, status, normalized messages
//! - [`adapter`] - One [`WireAdapter`] per dialect
//! - [`diff`] - Edit lists and the per-event [`DiffAccumulator`]
//! - [`endpoint`] - App config, API map and endpoint resolution
//! - [`event`] - Consumer-facing [`SubmissionEvent`]s
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use relay_core::diff::apply_raw_diff;
//! use serde_json::json;
//!
//! let next = apply_raw_diff(json!("processed"), &json!([["append", [], ": hi"]])).unwrap();
//! assert_eq!(next, json!("processed: hi"));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod adapter;
pub mod diff;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod message;
pub mod protocol;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use adapter::WireAdapter;
pub use diff::{apply_diff, DiffAccumulator, Edit, EditAction};
pub use endpoint::{
    resolve_endpoint, ApiInfo, AppConfig, Dependency, EndpointRef, Payload, ResolvedEndpoint,
};
pub use error::{CoreError, CoreResult};
pub use event::{DataEvent, EventContext, LogEvent, StatusEvent, SubmissionEvent};
pub use message::{
    LogLine, MessageKind, NormalizedMessage, Output, Stage, Status, WireFrame,
    BROKEN_CONNECTION_MSG, CLOSE_STREAM_MSG, PROCESS_COMPLETED_MSG, QUEUE_FULL_MSG,
    UNEXPECTED_ERROR_MSG,
};
pub use protocol::Protocol;
