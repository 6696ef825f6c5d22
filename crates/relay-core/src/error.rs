//! # Error Types
//!
//! Domain-specific error types for relay-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  relay-core errors (this file)                                         │
//! │  └── CoreError        - Endpoint lookup, diff and frame failures       │
//! │                                                                         │
//! │  relay-client errors (separate crate)                                  │
//! │  └── ClientError      - Transport, HTTP and config failures            │
//! │                                                                         │
//! │  Flow: CoreError → ClientError → terminal `error` status              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A malformed diff is protocol corruption: the reconciler returns it as an
//! `Err` and never repairs the value. Only the submission boundary turns it
//! into a status event.

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core protocol errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Endpoint name or function index did not resolve.
    ///
    /// ## When This Occurs
    /// - `submit("/missing", ...)` where no named endpoint matches
    /// - `submit(7, ...)` where the app only declares 3 dependencies
    ///
    /// Raised before any network activity.
    #[error("There is no endpoint matching that name or fn_index matching that number: {0}")]
    UnknownEndpoint(String),

    /// Edit action is valid but cannot be applied at the targeted location.
    ///
    /// `add` and `delete` need a container, so they are rejected at the root.
    #[error("Unsupported action at root: {action}")]
    UnsupportedEdit { action: String },

    /// Edit action is not one of `replace`, `append`, `add`, `delete`.
    #[error("Unknown action: {action}")]
    UnknownEdit { action: String },

    /// Edit is structurally invalid (bad shape, incompatible append operands).
    #[error("Invalid edit: {0}")]
    InvalidEdit(String),

    /// Edit path does not lead to an existing container.
    #[error("Invalid edit path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Wire frame could not be interpreted.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::MalformedFrame(err.to_string())
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Returns true if this error came from diff reconstruction.
    pub fn is_diff_error(&self) -> bool {
        matches!(
            self,
            CoreError::UnsupportedEdit { .. }
                | CoreError::UnknownEdit { .. }
                | CoreError::InvalidEdit(_)
                | CoreError::InvalidPath { .. }
        )
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::UnknownEdit {
            action: "splice".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown action: splice");

        let err = CoreError::InvalidPath {
            path: "[0, \"a\"]".to_string(),
            reason: "index out of bounds".to_string(),
        };
        assert!(err.to_string().contains("index out of bounds"));
    }

    #[test]
    fn test_diff_error_categorization() {
        assert!(CoreError::UnsupportedEdit {
            action: "add".into()
        }
        .is_diff_error());
        assert!(CoreError::InvalidEdit("bad".into()).is_diff_error());
        assert!(!CoreError::UnknownEndpoint("/x".into()).is_diff_error());
        assert!(!CoreError::MalformedFrame("eof".into()).is_diff_error());
    }
}
