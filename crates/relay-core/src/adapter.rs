//! # Wire Adapters
//!
//! One adapter per dialect, selected once per submission through
//! [`Protocol::adapter`]. All adapters share the frame table in
//! [`normalize_frame`]; they differ in how they treat closes, which control
//! directives they answer and whether generating frames carry diffs.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Adapter Responsibilities                         │
//! │                                                                         │
//! │  ADAPTER            DIRECTIVES          CLOSE          DIFFS           │
//! │  ─────────────────  ──────────────────  ─────────────  ─────           │
//! │  SocketAdapter      send_hash,send_data unclean→broken no              │
//! │  StreamV0Adapter    send_data (POST)    unclean→broken no              │
//! │  StreamV1Adapter    -                   unclean→broken no              │
//! │  DiffStreamAdapter  -                   unclean→broken yes (v2,2.1,3)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::diff::DiffAccumulator;
use crate::error::CoreResult;
use crate::message::{normalize_frame, MessageKind, NormalizedMessage, Stage, WireFrame};
use crate::protocol::Protocol;

// =============================================================================
// Adapter Contract
// =============================================================================

/// Converts dialect-specific frames into [`NormalizedMessage`]s.
pub trait WireAdapter: Send + Sync {
    /// The dialect this adapter speaks.
    fn protocol(&self) -> Protocol;

    /// Normalizes one frame given the caller's last surfaced stage.
    fn normalize(
        &self,
        frame: &WireFrame,
        last_stage: Option<Stage>,
    ) -> CoreResult<NormalizedMessage> {
        normalize_frame(frame, last_stage)
    }

    /// Parses and normalizes a text frame.
    fn normalize_text(
        &self,
        text: &str,
        last_stage: Option<Stage>,
    ) -> CoreResult<NormalizedMessage> {
        let frame = WireFrame::from_json(text)?;
        self.normalize(&frame, last_stage)
    }

    /// Translates a transport close. A clean close carries no message.
    fn normalize_close(&self, clean: bool) -> Option<NormalizedMessage> {
        if clean {
            None
        } else {
            Some(NormalizedMessage::broken_connection())
        }
    }

    /// Returns true if this dialect expects the client to answer `kind`.
    fn answers(&self, kind: MessageKind) -> bool {
        let _ = kind;
        false
    }

    /// Rebuilds full values for generating frames that carry diffs.
    fn reconstruct(
        &self,
        event_id: &str,
        message: &mut NormalizedMessage,
        diffs: &mut DiffAccumulator,
    ) -> CoreResult<()> {
        let _ = (event_id, message, diffs);
        Ok(())
    }
}

// =============================================================================
// Dialect Adapters
// =============================================================================

/// `ws`: answers both control directives over the socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketAdapter;

impl WireAdapter for SocketAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Ws
    }

    fn answers(&self, kind: MessageKind) -> bool {
        kind.is_directive()
    }
}

/// `sse`: payload is POSTed to the side channel on `send_data`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamV0Adapter;

impl WireAdapter for StreamV0Adapter {
    fn protocol(&self) -> Protocol {
        Protocol::Sse
    }

    fn answers(&self, kind: MessageKind) -> bool {
        kind == MessageKind::Data
    }
}

/// `sse_v1`: inline output on the shared stream, full values only.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamV1Adapter;

impl WireAdapter for StreamV1Adapter {
    fn protocol(&self) -> Protocol {
        Protocol::SseV1
    }
}

/// `sse_v2`, `sse_v2.1`, `sse_v3`: generating frames are diffs.
#[derive(Debug, Clone, Copy)]
pub struct DiffStreamAdapter {
    protocol: Protocol,
}

impl WireAdapter for DiffStreamAdapter {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn reconstruct(
        &self,
        event_id: &str,
        message: &mut NormalizedMessage,
        diffs: &mut DiffAccumulator,
    ) -> CoreResult<()> {
        if message.kind != MessageKind::Generating {
            return Ok(());
        }
        match message.output.as_mut() {
            Some(output) => diffs.apply_stream(event_id, &mut output.data),
            None => Ok(()),
        }
    }
}

static SOCKET: SocketAdapter = SocketAdapter;
static STREAM_V0: StreamV0Adapter = StreamV0Adapter;
static STREAM_V1: StreamV1Adapter = StreamV1Adapter;
static STREAM_V2: DiffStreamAdapter = DiffStreamAdapter {
    protocol: Protocol::SseV2,
};
static STREAM_V2_1: DiffStreamAdapter = DiffStreamAdapter {
    protocol: Protocol::SseV2_1,
};
static STREAM_V3: DiffStreamAdapter = DiffStreamAdapter {
    protocol: Protocol::SseV3,
};

impl Protocol {
    /// Returns the adapter for this dialect.
    pub fn adapter(&self) -> &'static dyn WireAdapter {
        match self {
            Protocol::Ws => &SOCKET,
            Protocol::Sse => &STREAM_V0,
            Protocol::SseV1 => &STREAM_V1,
            Protocol::SseV2 => &STREAM_V2,
            Protocol::SseV2_1 => &STREAM_V2_1,
            Protocol::SseV3 => &STREAM_V3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn generating(data: serde_json::Value) -> String {
        json!({
            "msg": "process_generating",
            "event_id": "evt",
            "success": true,
            "output": {"data": data}
        })
        .to_string()
    }

    #[test]
    fn test_adapter_selection() {
        for protocol in Protocol::ALL {
            assert_eq!(protocol.adapter().protocol(), protocol);
        }
    }

    #[test]
    fn test_directive_handling_per_dialect() {
        assert!(Protocol::Ws.adapter().answers(MessageKind::Hash));
        assert!(Protocol::Ws.adapter().answers(MessageKind::Data));
        assert!(!Protocol::Sse.adapter().answers(MessageKind::Hash));
        assert!(Protocol::Sse.adapter().answers(MessageKind::Data));
        assert!(!Protocol::SseV3.adapter().answers(MessageKind::Data));
    }

    #[test]
    fn test_close_translation() {
        let adapter = Protocol::Ws.adapter();
        assert!(adapter.normalize_close(true).is_none());

        let broken = adapter.normalize_close(false).unwrap();
        assert_eq!(broken.kind, MessageKind::UnexpectedError);
        let status = broken.status.unwrap();
        assert_eq!(status.stage, Stage::Error);
        assert!(status.broken);
    }

    #[test]
    fn test_diff_dialect_reconstructs_generating_frames() {
        let adapter = Protocol::SseV2.adapter();
        let mut diffs = DiffAccumulator::new();

        let mut first = adapter.normalize_text(&generating(json!([""])), None).unwrap();
        adapter.reconstruct("evt", &mut first, &mut diffs).unwrap();
        assert_eq!(first.output.unwrap().data, vec![json!("")]);

        let mut next = adapter
            .normalize_text(&generating(json!([[["append", [], "processed: hi"]]])), None)
            .unwrap();
        adapter.reconstruct("evt", &mut next, &mut diffs).unwrap();
        assert_eq!(next.output.unwrap().data, vec![json!("processed: hi")]);
    }

    #[test]
    fn test_v1_never_applies_diffs() {
        let adapter = Protocol::SseV1.adapter();
        let mut diffs = DiffAccumulator::new();
        let raw = json!([["append", [], "x"]]);

        let mut msg = adapter.normalize_text(&generating(json!([raw.clone()])), None).unwrap();
        adapter.reconstruct("evt", &mut msg, &mut diffs).unwrap();
        assert_eq!(msg.output.unwrap().data, vec![raw]);
        assert!(diffs.is_empty());
    }

    #[test]
    fn test_malformed_text_is_an_error() {
        assert!(Protocol::Ws.adapter().normalize_text("not json", None).is_err());
    }
}
