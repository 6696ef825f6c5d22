//! # Client Error Types
//!
//! Error types for connections, configuration and submissions.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Client Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  Core (diff, frame,     │ │
//! │  │  InvalidUrl     │  │  BrokenConn.    │  │        endpoint)        │ │
//! │  │  ConfigLoad/Save│  │  QueueFull, Http│  │  SerializationFailed    │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Inside a submission every variant ends up as one terminal `error`     │
//! │  status. Only `submit` (UnknownEndpoint) and `predict` return them.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use relay_core::CoreError;
use thiserror::Error;

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Client error type covering all possible client failures.
#[derive(Debug, Error)]
pub enum ClientError {
    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Endpoint lookup, diff reconstruction or frame parsing failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Failed to serialize or parse a JSON body.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid client configuration.
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),

    /// Invalid app root or derived URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to open a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed uncleanly or could not be opened.
    #[error("Connection errored out.")]
    BrokenConnection,

    /// The server's queue is at capacity.
    #[error("This application is currently busy. Please try again.")]
    QueueFull,

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    // =========================================================================
    // Submission Errors
    // =========================================================================
    /// The remote function finished with an error status.
    #[error("Submission failed: {message}")]
    Submission { message: String },

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        ClientError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            ClientError::ConnectionFailed(err.to_string())
        } else {
            ClientError::Http(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => ClientError::BrokenConnection,
            WsError::AlreadyClosed => ClientError::BrokenConnection,
            WsError::Protocol(p) => ClientError::WebSocketError(p.to_string()),
            WsError::Io(io) => ClientError::ConnectionFailed(io.to_string()),
            other => ClientError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for ClientError {
    fn from(err: toml::de::Error) -> Self {
        ClientError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for ClientError {
    fn from(err: toml::ser::Error) -> Self {
        ClientError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl ClientError {
    /// Returns true if a caller-level retry may succeed.
    ///
    /// The client itself never retries; this is for the caller's policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionFailed(_)
                | ClientError::BrokenConnection
                | ClientError::QueueFull
                | ClientError::WebSocketError(_)
        )
    }

    /// Returns true if this error indicates protocol corruption.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, ClientError::Core(_) | ClientError::SerializationFailed(_))
    }
}
