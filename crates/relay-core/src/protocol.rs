//! # Protocol Dialects
//!
//! The queue has been served over six wire revisions. Each is a variant of
//! [`Protocol`], resolved once per submission from the app config.
//!
//! ## Dialect Matrix
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Dialect Capabilities                            │
//! │                                                                         │
//! │  DIALECT   TRANSPORT          OUTPUT     DIFFS   STREAM CLOSES WHEN     │
//! │  ───────   ────────────────   ────────   ─────   ──────────────────     │
//! │  ws        socket /queue/join inline     no      socket closes          │
//! │  sse       GET /queue/join    inline     no      all events completed   │
//! │            + POST /queue/data                                           │
//! │  sse_v1    POST /queue/join   shared     no      all events completed   │
//! │            + GET /queue/data  stream                                    │
//! │  sse_v2    same as v1         shared     yes     all events completed   │
//! │  sse_v2.1  same as v1         shared     yes     all events completed   │
//! │  sse_v3    same as v1         shared     yes     close_stream frame     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Wire protocol dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Protocol {
    /// Full-duplex socket dialect.
    #[default]
    #[serde(rename = "ws")]
    Ws,

    /// Event-stream v0: per-call stream, payload pushed to a side channel.
    #[serde(rename = "sse")]
    Sse,

    /// Event-stream v1: shared stream, inline output.
    #[serde(rename = "sse_v1")]
    SseV1,

    /// Event-stream v2: generating frames carry diffs.
    #[serde(rename = "sse_v2")]
    SseV2,

    /// Event-stream v2.1: wire-compatible with v2.
    #[serde(rename = "sse_v2.1")]
    SseV2_1,

    /// Event-stream v3: stream closes only on `close_stream`.
    #[serde(rename = "sse_v3")]
    SseV3,
}

impl Protocol {
    /// All dialects, oldest first.
    pub const ALL: [Protocol; 6] = [
        Protocol::Ws,
        Protocol::Sse,
        Protocol::SseV1,
        Protocol::SseV2,
        Protocol::SseV2_1,
        Protocol::SseV3,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ws => "ws",
            Protocol::Sse => "sse",
            Protocol::SseV1 => "sse_v1",
            Protocol::SseV2 => "sse_v2",
            Protocol::SseV2_1 => "sse_v2.1",
            Protocol::SseV3 => "sse_v3",
        }
    }

    /// Returns true for the socket dialect.
    pub fn is_socket(&self) -> bool {
        matches!(self, Protocol::Ws)
    }

    /// Returns true if submissions join over POST and read the shared
    /// `/queue/data` stream.
    pub fn uses_shared_stream(&self) -> bool {
        matches!(
            self,
            Protocol::SseV1 | Protocol::SseV2 | Protocol::SseV2_1 | Protocol::SseV3
        )
    }

    /// Returns true if `process_generating` frames carry edit lists.
    pub fn uses_diffs(&self) -> bool {
        matches!(self, Protocol::SseV2 | Protocol::SseV2_1 | Protocol::SseV3)
    }

    /// Returns true if a `process_completed` frame retires its event id from
    /// the unclosed set, so the stream may close once the set is empty.
    pub fn closes_on_completion(&self) -> bool {
        matches!(
            self,
            Protocol::Sse | Protocol::SseV1 | Protocol::SseV2 | Protocol::SseV2_1
        )
    }

    /// Returns true if the stream may only close on an explicit
    /// `close_stream` frame.
    pub fn requires_close_stream(&self) -> bool {
        matches!(self, Protocol::SseV3)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| CoreError::MalformedFrame(format!("Unknown protocol dialect: '{}'", s)))
    }
}
