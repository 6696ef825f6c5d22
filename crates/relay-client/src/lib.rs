//! # relay-client: Transports & Submission Engine for Relay
//!
//! This crate turns a call to a remote app function into a pull-based
//! sequence of events, over whichever wire dialect the app speaks.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Submission Architecture                            │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      Client (one session)                        │  │
//! │  │                                                                  │  │
//! │  │  session hash • app config • API map • StreamSession            │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ submit()                                │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      Submission                                  │  │
//! │  │                                                                  │  │
//! │  │  next() ──► connect ──► frame ──► WireAdapter ──► events        │  │
//! │  │  SubmissionHandle: cancel() / destroy() from any task           │  │
//! │  └───────┬───────────────────────┬──────────────────────┬──────────┘  │
//! │          ▼                       ▼                      ▼              │
//! │  ┌────────────────┐  ┌─────────────────────┐  ┌──────────────────┐     │
//! │  │ socket (ws)    │  │ event stream (sse)  │  │ StreamSession    │     │
//! │  │ one per call   │  │ one per call        │  │ shared stream    │     │
//! │  │                │  │ + POST /queue/data  │  │ v1..v3, routed   │     │
//! │  └────────────────┘  └─────────────────────┘  │ by event_id      │     │
//! │                                               └──────────────────┘     │
//! │                                                                         │
//! │  Every connection is read through one TransportIterator; the only     │
//! │  spawned tasks are transport pumps and the shared-stream dispatcher.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`client`] - `Client`, `ClientBuilder`, `predict`
//! - [`submit`] - Submission state machine and `SubmissionHandle`
//! - [`session`] - Shared event stream for dialects v1–v3
//! - [`transport`] - `TransportIterator`, socket and event-stream pumps
//! - [`connector`] - Network boundary (`Connector`, `HttpConnector`)
//! - [`authorization`] - Elevated-compute headers from an embedding parent
//! - [`config`] - Client configuration (session, credentials, origin)
//! - [`error`] - Client error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_client::{Client, ClientConfig};
//! use relay_core::{AppConfig, ApiInfo, Protocol};
//!
//! let app = AppConfig::new("https://my-app.example", Protocol::SseV3);
//! let client = Client::builder(app, api_info)
//!     .config(ClientConfig::load_or_default(None))
//!     .build()?;
//!
//! let mut submission = client.submit("/predict", vec![json!("hi")], None, None)?;
//! let handle = submission.handle();
//! while let Some(event) = submission.next().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod authorization;
pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod session;
pub mod submit;
pub mod transport;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use authorization::{elevated_headers, ParentFrame};
pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use connector::{Connector, Headers, HttpConnector, HttpReply};
pub use error::{ClientError, ClientResult};
pub use session::StreamSession;
pub use submit::{Submission, SubmissionHandle};
pub use transport::{Frame, FrameFeed, TransportIterator};
