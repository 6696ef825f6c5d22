//! # Wire Frames & Normalized Messages
//!
//! Every dialect eventually delivers JSON frames tagged by a `msg` field.
//! This module defines the raw [`WireFrame`] and the small vocabulary they
//! are normalized into.
//!
//! ## Frame Vocabulary
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Wire msg → MessageKind                             │
//! │                                                                         │
//! │  CONTROL (client must respond)                                         │
//! │  ─────────────────────────────                                         │
//! │  send_hash            ──► Hash        echo {fn_index, session_hash}    │
//! │  send_data            ──► Data        push the submission payload      │
//! │                                                                         │
//! │  PROGRESS                                                              │
//! │  ────────                                                              │
//! │  estimation           ──► Update      queue position / eta             │
//! │  process_starts       ──► Update      stage pending                    │
//! │  progress             ──► Update      progress bars                    │
//! │  queue_full           ──► Update      stage error                      │
//! │  process_generating   ──► Generating  partial output (maybe a diff)    │
//! │  log                  ──► Log                                          │
//! │  heartbeat            ──► Heartbeat   ignored                          │
//! │                                                                         │
//! │  TERMINAL                                                              │
//! │  ────────                                                              │
//! │  process_completed    ──► Complete    (Update+error if output.error)   │
//! │  unexpected_error     ──► UnexpectedError                              │
//! │                                                                         │
//! │  close_stream is a transport sentinel and never reaches this table.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{CoreError, CoreResult};

// =============================================================================
// User-Facing Messages
// =============================================================================

/// Shown when the server rejects a join because its queue is at capacity.
pub const QUEUE_FULL_MSG: &str = "This application is currently busy. Please try again. ";

/// Shown when a connection could not be opened or closed uncleanly.
pub const BROKEN_CONNECTION_MSG: &str = "Connection errored out. ";

/// Shown for any failure caught at the submission boundary.
pub const UNEXPECTED_ERROR_MSG: &str = "An Unexpected Error Occurred!";

/// Control sentinel on event streams. Never surfaced to consumers.
pub const CLOSE_STREAM_MSG: &str = "close_stream";

/// Terminal per-event frame on event streams.
pub const PROCESS_COMPLETED_MSG: &str = "process_completed";

// =============================================================================
// Stage & Status
// =============================================================================

/// Coarse lifecycle position of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pending,
    Queued,
    Generating,
    Complete,
    Error,
}

impl Stage {
    /// Returns true for `complete` and `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Pending => write!(f, "pending"),
            Stage::Queued => write!(f, "queued"),
            Stage::Generating => write!(f, "generating"),
            Stage::Complete => write!(f, "complete"),
            Stage::Error => write!(f, "error"),
        }
    }
}

/// Status attached to a normalized message or status event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub stage: Stage,

    /// Whether the call went through the queue.
    pub queue: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,

    /// Position in queue (0 = next).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,

    /// Queue length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Estimated seconds remaining.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    /// Set when the connection broke rather than the function failing.
    #[serde(default)]
    pub broken: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_data: Option<Value>,
}

impl Status {
    pub fn new(stage: Stage) -> Self {
        Status {
            stage,
            queue: true,
            message: None,
            code: None,
            position: None,
            size: None,
            eta: None,
            success: None,
            broken: false,
            progress_data: None,
        }
    }

    /// Terminal error status with a message.
    pub fn error(message: impl Into<String>) -> Self {
        Status {
            message: Some(message.into()),
            ..Status::new(Stage::Error)
        }
    }

    /// Terminal error status for a broken or unopenable connection.
    pub fn broken_connection() -> Self {
        Status {
            broken: true,
            ..Status::error(BROKEN_CONNECTION_MSG)
        }
    }

    pub fn with_queue(mut self, queue: bool) -> Self {
        self.queue = queue;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

// =============================================================================
// Raw Wire Frame
// =============================================================================

/// One JSON frame as sent by the server.
///
/// Only `msg` is always present; everything else depends on the frame type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(default)]
    pub msg: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank_eta: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_duration: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl WireFrame {
    /// Parses a frame from its JSON text.
    pub fn from_json(text: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parses a frame from an already decoded JSON value.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Returns true for the `close_stream` control sentinel.
    pub fn is_close_stream(&self) -> bool {
        self.msg == CLOSE_STREAM_MSG
    }

    /// Returns true for the terminal per-event frame.
    pub fn is_completion(&self) -> bool {
        self.msg == PROCESS_COMPLETED_MSG
    }

    /// Synthesized frame announcing a broken connection.
    pub fn broken_connection() -> Self {
        WireFrame {
            msg: "unexpected_error".into(),
            message: Some(BROKEN_CONNECTION_MSG.into()),
            success: Some(false),
            ..Default::default()
        }
    }
}

/// The `output` object of data-bearing frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    /// One value per output component, in schema order.
    #[serde(default)]
    pub data: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_duration: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Output {
    fn parse(raw: &Value) -> CoreResult<Self> {
        serde_json::from_value(raw.clone())
            .map_err(|e| CoreError::MalformedFrame(format!("invalid output: {}", e)))
    }

    /// Returns the server error as text, if the output carries one.
    pub fn error_message(&self) -> Option<String> {
        match &self.error {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// A log line emitted by the running function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub log: String,
    pub level: String,
}

// =============================================================================
// Normalized Message
// =============================================================================

/// Internal message vocabulary every dialect is reduced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Hash,
    Data,
    Update,
    Complete,
    Generating,
    Log,
    UnexpectedError,
    Heartbeat,
    None,
}

impl MessageKind {
    /// Returns true if the client must answer before the server proceeds.
    pub fn is_directive(&self) -> bool {
        matches!(self, MessageKind::Hash | MessageKind::Data)
    }
}

/// One frame after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub kind: MessageKind,
    pub status: Option<Status>,
    pub output: Option<Output>,
    pub log: Option<LogLine>,
    pub event_id: Option<String>,
}

impl NormalizedMessage {
    pub fn new(kind: MessageKind) -> Self {
        NormalizedMessage {
            kind,
            status: None,
            output: None,
            log: None,
            event_id: None,
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_output(mut self, output: Option<Output>) -> Self {
        self.output = output;
        self
    }

    /// The message every dialect produces for a broken connection.
    pub fn broken_connection() -> Self {
        NormalizedMessage::new(MessageKind::UnexpectedError)
            .with_status(Status::broken_connection())
    }
}

/// Maps a raw frame to the normalized vocabulary.
///
/// `last_stage` is the most recent stage the caller surfaced for the
/// function; `estimation` frames keep it rather than resetting to pending.
pub fn normalize_frame(
    frame: &WireFrame,
    last_stage: Option<Stage>,
) -> CoreResult<NormalizedMessage> {
    let success = frame.success.unwrap_or(false);
    let output = frame.output.as_ref().map(Output::parse).transpose()?;

    let message = match frame.msg.as_str() {
        "send_hash" => NormalizedMessage::new(MessageKind::Hash),

        "send_data" => NormalizedMessage::new(MessageKind::Data),

        "heartbeat" => NormalizedMessage::new(MessageKind::Heartbeat),

        "queue_full" => NormalizedMessage::new(MessageKind::Update).with_status(Status {
            code: frame.code.clone(),
            success: frame.success,
            ..Status::error(QUEUE_FULL_MSG)
        }),

        "unexpected_error" => {
            NormalizedMessage::new(MessageKind::UnexpectedError).with_status(Status {
                message: frame.message.clone(),
                success: Some(false),
                broken: frame.message.as_deref() == Some(BROKEN_CONNECTION_MSG),
                ..Status::new(Stage::Error)
            })
        }

        "estimation" => NormalizedMessage::new(MessageKind::Update).with_status(Status {
            code: frame.code.clone(),
            size: frame.queue_size,
            position: frame.rank,
            eta: frame.rank_eta,
            success: frame.success,
            ..Status::new(last_stage.unwrap_or(Stage::Pending))
        }),

        "progress" => NormalizedMessage::new(MessageKind::Update).with_status(Status {
            code: frame.code.clone(),
            progress_data: frame.progress_data.clone(),
            success: frame.success,
            ..Status::new(Stage::Pending)
        }),

        "log" => NormalizedMessage {
            log: Some(LogLine {
                log: frame.log.clone().unwrap_or_default(),
                level: frame.level.clone().unwrap_or_else(|| "info".to_string()),
            }),
            ..NormalizedMessage::new(MessageKind::Log)
        },

        "process_generating" => {
            let error = output.as_ref().and_then(Output::error_message);
            NormalizedMessage::new(MessageKind::Generating)
                .with_status(Status {
                    message: if success { None } else { error },
                    code: frame.code.clone(),
                    progress_data: frame.progress_data.clone(),
                    eta: frame.average_duration,
                    success: frame.success,
                    ..Status::new(if success { Stage::Generating } else { Stage::Error })
                })
                .with_output(if success { output } else { None })
        }

        "process_completed" => {
            let error = output.as_ref().and_then(Output::error_message);
            if let Some(error) = error {
                NormalizedMessage::new(MessageKind::Update).with_status(Status {
                    code: frame.code.clone(),
                    success: frame.success,
                    ..Status::error(error)
                })
            } else {
                let eta = output.as_ref().and_then(|o| o.average_duration);
                NormalizedMessage::new(MessageKind::Complete)
                    .with_status(Status {
                        message: None,
                        code: frame.code.clone(),
                        progress_data: frame.progress_data.clone(),
                        eta,
                        success: frame.success,
                        ..Status::new(if success { Stage::Complete } else { Stage::Error })
                    })
                    .with_output(if success { output } else { None })
            }
        }

        "process_starts" => NormalizedMessage::new(MessageKind::Update).with_status(Status {
            code: frame.code.clone(),
            size: frame.rank,
            position: Some(0),
            eta: frame.eta,
            success: frame.success,
            ..Status::new(Stage::Pending)
        }),

        _ => NormalizedMessage::new(MessageKind::None),
    };

    Ok(NormalizedMessage {
        event_id: frame.event_id.clone(),
        ..message
    })
}
