//! # Submission Events
//!
//! The consumer-facing vocabulary. Every dialect, after normalization and
//! diff reconstruction, is surfaced as a sequence of [`SubmissionEvent`]s.
//!
//! ## Sequence Shape
//! ```text
//! status(pending)
//!   ├── status(queued/pending)*      queue position, eta, progress
//!   ├── log*
//!   ├── (status(generating), data)*  partial outputs
//!   ├── data                         final output (successful calls)
//!   └── status(complete | error)     always last, exactly once
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{LogLine, Stage, Status};

/// Status change for one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(flatten)]
    pub status: Status,
    pub endpoint: String,
    pub fn_index: usize,
    pub time: DateTime<Utc>,
}

/// Output values, partial or final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    pub data: Vec<Value>,
    pub endpoint: String,
    pub fn_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<u64>,
    pub time: DateTime<Utc>,
}

/// Log line emitted by the remote function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub log: String,
    pub level: String,
    pub endpoint: String,
    pub fn_index: usize,
}

/// One element of a submission's event sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SubmissionEvent {
    Status(StatusEvent),
    Data(DataEvent),
    Log(LogEvent),
}

impl SubmissionEvent {
    /// Stage of a status event, `None` for data and log events.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SubmissionEvent::Status(event) => Some(event.status.stage),
            _ => None,
        }
    }

    /// Returns true for `complete` and `error` status events.
    pub fn is_terminal(&self) -> bool {
        self.stage().map(|s| s.is_terminal()).unwrap_or(false)
    }

    pub fn as_status(&self) -> Option<&Status> {
        match self {
            SubmissionEvent::Status(event) => Some(&event.status),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[Value]> {
        match self {
            SubmissionEvent::Data(event) => Some(&event.data),
            _ => None,
        }
    }
}

// =============================================================================
// Event Builder
// =============================================================================

/// Stamps events with the submission's endpoint metadata.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub endpoint: String,
    pub fn_index: usize,
    pub event_data: Option<Value>,
    pub trigger_id: Option<u64>,
}

impl EventContext {
    pub fn status(&self, status: Status) -> SubmissionEvent {
        SubmissionEvent::Status(StatusEvent {
            status,
            endpoint: self.endpoint.clone(),
            fn_index: self.fn_index,
            time: Utc::now(),
        })
    }

    pub fn data(&self, data: Vec<Value>) -> SubmissionEvent {
        SubmissionEvent::Data(DataEvent {
            data,
            endpoint: self.endpoint.clone(),
            fn_index: self.fn_index,
            event_data: self.event_data.clone(),
            trigger_id: self.trigger_id,
            time: Utc::now(),
        })
    }

    pub fn log(&self, line: LogLine) -> SubmissionEvent {
        SubmissionEvent::Log(LogEvent {
            log: line.log,
            level: line.level,
            endpoint: self.endpoint.clone(),
            fn_index: self.fn_index,
        })
    }
}
