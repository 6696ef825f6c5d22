//! # Event-Stream Decoding
//!
//! [`SseDecoder`] turns raw body chunks into event payloads; [`spawn_body`]
//! pumps a reqwest response body through it into a [`TransportIterator`].
//!
//! ## Wire Format
//! ```text
//! : comment line            ignored
//! event: message            ignored (only data matters here)
//! data: {"msg":"estimation",
//! data:  "rank":0}          joined with '\n'
//!                           blank line dispatches the event
//! ```
//! Chunks may split anywhere, including inside a UTF-8 sequence or between
//! `\r` and `\n`.

use futures_util::StreamExt;
use tracing::{debug, warn};

use super::{FrameFeed, TransportIterator};

// =============================================================================
// Decoder
// =============================================================================

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk, returning every event payload it completed.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut events = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.line);
                let line = String::from_utf8_lossy(&raw);
                let line = line.strip_suffix('\r').unwrap_or(&*line);
                if let Some(event) = self.process_line(line) {
                    events.push(event);
                }
            } else {
                self.line.push(byte);
            }
        }
        events
    }

    /// Flushes an event left pending when the body ends without a blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.line.is_empty() {
            let raw = std::mem::take(&mut self.line);
            let line = String::from_utf8_lossy(&raw).into_owned();
            self.process_line(line.strip_suffix('\r').unwrap_or(line.as_str()));
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data).join("\n"))
    }
}

// =============================================================================
// Body Pump
// =============================================================================

/// Spawns a pump that decodes `response`'s body into a new iterator.
pub fn spawn_body(response: reqwest::Response) -> TransportIterator {
    let (feed, iterator) = TransportIterator::channel();
    tokio::spawn(pump(response, feed));
    iterator
}

async fn pump(response: reqwest::Response, feed: FrameFeed) {
    let url = response.url().to_string();
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    loop {
        tokio::select! {
            _ = feed.closed() => {
                debug!(%url, "Consumer closed, dropping event stream");
                return;
            }

            chunk = body.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        for event in decoder.decode(&bytes) {
                            if !feed.push(event) {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(%url, ?e, "Event stream errored");
                        feed.close(false);
                        return;
                    }
                    None => {
                        if let Some(event) = decoder.finish() {
                            feed.push(event);
                        }
                        debug!(%url, "Event stream ended");
                        feed.close(true);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.decode(b"data: {\"msg\":\"heartbeat\"}\n\n");
        assert_eq!(events, vec!["{\"msg\":\"heartbeat\"}".to_string()]);
    }

    #[test]
    fn test_split_chunks_and_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode(b"data: {\"msg\":").is_empty());
        assert!(decoder.decode(b"\"estimation\"}\r").is_empty());
        let events = decoder.decode(b"\n\r\n");
        assert_eq!(events, vec!["{\"msg\":\"estimation\"}".to_string()]);
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.decode(b": keepalive\nevent: message\ndata: a\ndata:b\n\ndata: c\n\n");
        assert_eq!(events, vec!["a\nb".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_utf8_split_inside_a_character() {
        let mut decoder = SseDecoder::new();
        let bytes = "data: héllo\n\n".as_bytes();
        let (head, tail) = bytes.split_at(8);
        assert!(decoder.decode(head).is_empty());
        assert_eq!(decoder.decode(tail), vec!["héllo".to_string()]);
    }

    #[test]
    fn test_finish_flushes_pending_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode(b"data: tail").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
        assert_eq!(decoder.finish(), None);
    }
}
