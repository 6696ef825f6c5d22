//! # Stream Session Coordinator
//!
//! Event-stream dialects v1–v3 multiplex every submission of a client over
//! one `GET /queue/data` stream. This module owns that stream and routes its
//! frames to per-event [`TransportIterator`]s.
//!
//! ## Routing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Shared Stream Dispatcher                          │
//! │                                                                         │
//! │   GET /queue/data?session_hash ──► dispatcher task                     │
//! │                                          │                              │
//! │          ┌───────────────────────────────┼─────────────────────────┐   │
//! │          ▼                               ▼                         ▼   │
//! │   msg == close_stream             no event_id               event_id   │
//! │   ──► close everything            ──► every route           ──► route  │
//! │                                                          (or pending)  │
//! │                                                                         │
//! │   process_completed(id):                                               │
//! │     route(id) finished                                                  │
//! │     v1/v2/v2.1: unclosed.remove(id); empty? ──► close stream           │
//! │     v3:         stream stays open until close_stream                    │
//! │                                                                         │
//! │   Stream could not open ──► each route gets one broken-connection frame │
//! │   Stream broke          ──► each route gets Closed { clean: false }     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Closing always clears the unclosed set, so the set is empty exactly when
//! no stream is open.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use relay_core::{CoreResult, DiffAccumulator, NormalizedMessage, Protocol, WireFrame};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::{Connector, Headers};
use crate::transport::{Frame, FrameFeed, TransportIterator};

// =============================================================================
// Router State
// =============================================================================

/// A frame held for an event that has not registered yet.
#[derive(Debug)]
struct PendingFrame {
    text: String,
    completes: bool,
}

/// The currently open (or opening) shared stream.
#[derive(Debug)]
struct OpenStream {
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct EventRouter {
    stream: Option<OpenStream>,
    generations: u64,
    unclosed: HashSet<String>,
    routes: HashMap<String, FrameFeed>,
    pending: HashMap<String, Vec<PendingFrame>>,

    /// Events dropped before completion on the current stream; their late
    /// frames are discarded.
    released: HashSet<String>,
}

impl EventRouter {
    fn is_current(&self, generation: u64) -> bool {
        self.stream.as_ref().map(|s| s.generation == generation).unwrap_or(false)
    }

    /// Marks a new stream as opening and returns its generation and token.
    fn begin_stream(&mut self) -> (u64, CancellationToken) {
        self.generations += 1;
        let token = CancellationToken::new();
        self.stream = Some(OpenStream {
            generation: self.generations,
            token: token.clone(),
        });
        (self.generations, token)
    }

    fn end_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.token.cancel();
        }
    }

    /// Drops an event's route and set entry. Returns true if the stream
    /// should now close.
    fn retire(&mut self, event_id: &str, protocol: Protocol) -> bool {
        if let Some(feed) = self.routes.remove(event_id) {
            feed.close(true);
        }
        if !protocol.closes_on_completion() {
            return false;
        }
        self.unclosed.remove(event_id) && self.unclosed.is_empty()
    }

    /// Drops an event before its completion. Returns true if the stream
    /// should now close.
    ///
    /// Only closes-on-completion dialects take the id out of the unclosed
    /// set; v3 keeps it until `close_stream`.
    fn release(&mut self, event_id: &str, protocol: Protocol) -> bool {
        self.pending.remove(event_id);
        let Some(feed) = self.routes.remove(event_id) else {
            return false;
        };
        feed.close(true);
        if self.stream.is_some() {
            self.released.insert(event_id.to_string());
        }
        protocol.closes_on_completion()
            && self.unclosed.remove(event_id)
            && self.unclosed.is_empty()
    }

    /// Closes the stream. Remaining routes see `Closed { clean }`.
    fn shutdown(&mut self, clean: bool) {
        self.end_stream();
        for (_, feed) in self.routes.drain() {
            feed.close(clean);
        }
        self.unclosed.clear();
        self.pending.clear();
        self.released.clear();
    }

    /// The stream could not be opened.
    fn fail_open(&mut self) {
        let broken = serde_json::to_string(&WireFrame::broken_connection()).unwrap_or_default();
        self.end_stream();
        for (event_id, feed) in self.routes.drain() {
            debug!(%event_id, "Delivering broken connection");
            feed.push(broken.clone());
            feed.close(false);
        }
        self.unclosed.clear();
        self.pending.clear();
        self.released.clear();
    }
}

// =============================================================================
// Stream Session
// =============================================================================

/// Owner of the shared event stream for one client session.
pub struct StreamSession {
    connector: Arc<dyn Connector>,
    url: String,
    protocol: Protocol,
    router: Arc<Mutex<EventRouter>>,
    diffs: Mutex<DiffAccumulator>,
}

impl StreamSession {
    /// `url` is the fully built `/queue/data?session_hash=..` address.
    pub fn new(connector: Arc<dyn Connector>, url: String, protocol: Protocol) -> Self {
        StreamSession {
            connector,
            url,
            protocol,
            router: Arc::new(Mutex::new(EventRouter::default())),
            diffs: Mutex::new(DiffAccumulator::new()),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Registers an event and returns the iterator its frames arrive on.
    ///
    /// Opens the shared stream if none is open. Frames that arrived before
    /// registration are delivered first.
    pub async fn register(&self, event_id: &str) -> TransportIterator {
        let (feed, iterator) = TransportIterator::channel();

        let open = {
            let mut router = self.router.lock().await;

            let mut completed = false;
            for frame in router.pending.remove(event_id).unwrap_or_default() {
                completed |= frame.completes;
                feed.push(frame.text);
            }
            if completed {
                debug!(%event_id, "Event completed before registration");
                feed.close(true);
                return iterator;
            }

            router.routes.insert(event_id.to_string(), feed);
            router.unclosed.insert(event_id.to_string());

            if router.stream.is_none() {
                Some(router.begin_stream())
            } else {
                None
            }
        };

        if let Some((generation, token)) = open {
            self.open(generation, token).await;
        }
        iterator
    }

    /// Forgets an event, e.g. after a cancel or a failed submission.
    ///
    /// A no-op for events whose completion was already routed. Closes the
    /// stream if this was the last outstanding event of a
    /// closes-on-completion dialect.
    pub async fn release(&self, event_id: &str) {
        let mut router = self.router.lock().await;
        if router.release(event_id, self.protocol) {
            info!(%event_id, "Last event released, closing shared stream");
            router.shutdown(true);
        }
    }

    /// Rebuilds full values for diff-carrying frames of `event_id`.
    pub async fn reconstruct(
        &self,
        event_id: &str,
        message: &mut NormalizedMessage,
    ) -> CoreResult<()> {
        let mut diffs = self.diffs.lock().await;
        self.protocol.adapter().reconstruct(event_id, message, &mut diffs)
    }

    /// Drops the accumulated value of a finished event.
    pub async fn discard_diffs(&self, event_id: &str) {
        self.diffs.lock().await.discard(event_id);
    }

    /// Returns true while a shared stream is open or opening.
    pub async fn is_open(&self) -> bool {
        self.router.lock().await.stream.is_some()
    }

    /// Event ids still awaiting completion.
    pub async fn unclosed_events(&self) -> HashSet<String> {
        self.router.lock().await.unclosed.clone()
    }

    async fn open(&self, generation: u64, token: CancellationToken) {
        info!(url = %self.url, protocol = %self.protocol, "Opening shared stream");

        match self.connector.get_stream(&self.url, &Headers::new()).await {
            Ok(stream) => {
                if !self.router.lock().await.is_current(generation) {
                    debug!("Shared stream no longer needed");
                    return;
                }
                tokio::spawn(dispatch(self.router.clone(), self.protocol, stream, token));
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Failed to open shared stream");
                let mut router = self.router.lock().await;
                if router.is_current(generation) {
                    router.fail_open();
                }
            }
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

async fn dispatch(
    router: Arc<Mutex<EventRouter>>,
    protocol: Protocol,
    mut stream: TransportIterator,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            frame = stream.next() => Some(frame),
        };
        let Some(frame) = frame else {
            debug!("Shared stream closed");
            stream.close();
            return;
        };

        let mut state = router.lock().await;
        if token.is_cancelled() {
            stream.close();
            return;
        }

        match frame {
            None | Some(Frame::Closed { clean: true }) => {
                info!("Shared stream ended");
                state.shutdown(true);
                return;
            }
            Some(Frame::Closed { clean: false }) => {
                warn!("Shared stream broke");
                state.shutdown(false);
                return;
            }
            Some(Frame::Text(text)) => {
                let parsed = match WireFrame::from_json(&text) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed shared frame");
                        continue;
                    }
                };

                if parsed.is_close_stream() {
                    info!("close_stream received");
                    state.shutdown(true);
                    stream.close();
                    return;
                }

                let should_close = match parsed.event_id.as_deref() {
                    None => {
                        for feed in state.routes.values() {
                            feed.push(text.clone());
                        }
                        false
                    }
                    Some(event_id) => {
                        route(&mut state, event_id, text, parsed.is_completion(), protocol)
                    }
                };

                if should_close {
                    info!("All events completed, closing shared stream");
                    state.shutdown(true);
                    stream.close();
                    return;
                }
            }
        }
    }
}

/// Delivers one event frame. Returns true if the stream should close.
fn route(
    state: &mut EventRouter,
    event_id: &str,
    text: String,
    completes: bool,
    protocol: Protocol,
) -> bool {
    if state.released.contains(event_id) {
        if completes {
            state.released.remove(event_id);
        }
        debug!(%event_id, "Dropping frame for released event");
        return false;
    }

    let Some(feed) = state.routes.get(event_id) else {
        state
            .pending
            .entry(event_id.to_string())
            .or_default()
            .push(PendingFrame { text, completes });
        return false;
    };

    if !feed.push(text) {
        debug!(%event_id, "Route dropped by consumer");
        let close = state.release(event_id, protocol);
        if completes {
            state.released.remove(event_id);
        }
        return close;
    }

    if completes {
        debug!(%event_id, "Event completed");
        return state.retire(event_id, protocol);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::testing::ScriptedConnector;
    use serde_json::json;

    fn frame(value: serde_json::Value) -> String {
        value.to_string()
    }

    fn completed(event_id: &str) -> String {
        frame(json!({"msg": "process_completed", "event_id": event_id, "success": true,
                     "output": {"data": []}}))
    }

    fn session(connector: Arc<ScriptedConnector>, protocol: Protocol) -> StreamSession {
        StreamSession::new(connector, "http://app/queue/data?session_hash=s".into(), protocol)
    }

    async fn drain(iter: &mut TransportIterator) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = iter.next().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_routes_frames_by_event_and_closes_when_all_complete() {
        let connector = Arc::new(ScriptedConnector::new());
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));
        let session = session(connector.clone(), Protocol::SseV2);

        let mut a = session.register("a").await;
        let mut b = session.register("b").await;
        assert_eq!(connector.stream_urls().len(), 1);

        feed.push(frame(json!({"msg": "heartbeat"})));
        feed.push(frame(json!({"msg": "estimation", "event_id": "b", "rank": 0})));
        feed.push(completed("a"));

        let frames_a = drain(&mut a).await;
        assert_eq!(frames_a.len(), 3);
        assert_eq!(frames_a[2], Frame::Closed { clean: true });
        assert!(session.is_open().await);
        assert_eq!(session.unclosed_events().await, HashSet::from(["b".to_string()]));

        feed.push(completed("b"));
        let frames_b = drain(&mut b).await;
        assert_eq!(frames_b.len(), 4);

        assert!(session.unclosed_events().await.is_empty());
        assert!(!session.is_open().await);
        assert!(feed.is_closed());
    }

    #[tokio::test]
    async fn test_unclosed_set_empty_iff_closed_for_any_interleaving() {
        let orders: [[&str; 3]; 3] = [["a", "b", "c"], ["c", "a", "b"], ["b", "c", "a"]];
        for order in orders {
            let connector = Arc::new(ScriptedConnector::new());
            let (feed, stream) = TransportIterator::channel();
            connector.stream(Ok(stream));
            let session = session(connector, Protocol::SseV1);

            let mut routes = Vec::new();
            for id in ["a", "b", "c"] {
                routes.push(session.register(id).await);
            }

            for (done, id) in order.iter().enumerate() {
                feed.push(completed(id));
                let index = ["a", "b", "c"].iter().position(|x| x == id).unwrap();
                drain(&mut routes[index]).await;

                let unclosed = session.unclosed_events().await;
                assert_eq!(unclosed.len(), 2 - done);
                assert_eq!(unclosed.is_empty(), !session.is_open().await);
            }
        }
    }

    #[tokio::test]
    async fn test_v3_waits_for_close_stream() {
        let connector = Arc::new(ScriptedConnector::new());
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));
        let session = session(connector, Protocol::SseV3);

        let mut a = session.register("a").await;
        feed.push(completed("a"));
        drain(&mut a).await;
        assert!(session.is_open().await);

        let mut b = session.register("b").await;
        feed.push(frame(json!({"msg": "close_stream"})));
        assert_eq!(drain(&mut b).await, vec![Frame::Closed { clean: true }]);
        assert!(!session.is_open().await);
        assert!(session.unclosed_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_delivers_one_broken_frame() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.stream(Err(ClientError::ConnectionFailed("refused".into())));
        let session = session(connector.clone(), Protocol::SseV2);

        let mut a = session.register("a").await;
        let frames = drain(&mut a).await;
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Text(text) => {
                let parsed = WireFrame::from_json(text).unwrap();
                assert_eq!(parsed.msg, "unexpected_error");
            }
            other => panic!("expected broken frame, got {:?}", other),
        }
        assert!(!session.is_open().await);
        assert_eq!(connector.stream_urls().len(), 1);
    }

    #[tokio::test]
    async fn test_unclean_end_reaches_every_route() {
        let connector = Arc::new(ScriptedConnector::new());
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));
        let session = session(connector, Protocol::SseV2_1);

        let mut a = session.register("a").await;
        let mut b = session.register("b").await;
        feed.close(false);

        assert_eq!(drain(&mut a).await, vec![Frame::Closed { clean: false }]);
        assert_eq!(drain(&mut b).await, vec![Frame::Closed { clean: false }]);
        assert!(session.unclosed_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_frames_before_registration_are_buffered() {
        let connector = Arc::new(ScriptedConnector::new());
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));
        let session = session(connector, Protocol::SseV3);

        let mut a = session.register("a").await;
        feed.push(frame(json!({"msg": "process_starts", "event_id": "late"})));
        feed.push(completed("a"));
        drain(&mut a).await;

        let mut late = session.register("late").await;
        let first = late.next().await;
        assert!(matches!(first, Some(Frame::Text(ref t)) if t.contains("process_starts")));
    }

    #[tokio::test]
    async fn test_release_closes_when_last() {
        let connector = Arc::new(ScriptedConnector::new());
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));
        let session = session(connector, Protocol::SseV2);

        let _a = session.register("a").await;
        tokio::task::yield_now().await;
        session.release("a").await;

        assert!(!session.is_open().await);
        assert!(session.unclosed_events().await.is_empty());
        feed.closed().await;
    }

    #[tokio::test]
    async fn test_malformed_shared_frame_is_skipped() {
        let connector = Arc::new(ScriptedConnector::new());
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));
        let session = session(connector, Protocol::SseV2);

        let mut a = session.register("a").await;
        feed.push("not json");
        feed.push(completed("a"));
        let frames = drain(&mut a).await;
        assert_eq!(frames.len(), 2);
    }

    fn generating(event_id: &str, n: usize) -> String {
        frame(json!({"msg": "process_generating", "event_id": event_id, "success": true,
                     "output": {"data": [n]}}))
    }

    #[tokio::test]
    async fn test_frames_for_released_event_are_discarded() {
        let connector = Arc::new(ScriptedConnector::new());
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));
        let session = session(connector, Protocol::SseV2);

        let _a = session.register("a").await;
        let mut b = session.register("b").await;
        session.release("a").await;
        assert!(session.is_open().await);

        for n in 0..100 {
            feed.push(generating("a", n));
        }
        feed.push(completed("a"));
        {
            // wait until the dispatcher has consumed a's frames
            let mut tries = 0;
            while session.router.lock().await.released.contains("a") && tries < 1000 {
                tokio::task::yield_now().await;
                tries += 1;
            }
        }
        let router = session.router.lock().await;
        assert!(router.pending.is_empty());
        assert!(router.released.is_empty());
        drop(router);

        feed.push(frame(json!({"msg": "process_starts", "event_id": "never-registered"})));
        feed.push(completed("b"));
        drain(&mut b).await;

        let router = session.router.lock().await;
        assert!(router.stream.is_none());
        assert!(router.pending.is_empty());
        assert!(router.released.is_empty());
    }

    #[tokio::test]
    async fn test_v3_release_keeps_event_until_close_stream() {
        let connector = Arc::new(ScriptedConnector::new());
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));
        let session = session(connector, Protocol::SseV3);

        let mut a = session.register("a").await;
        feed.push(completed("a"));
        drain(&mut a).await;
        session.release("a").await;
        assert_eq!(session.unclosed_events().await, HashSet::from(["a".to_string()]));
        assert!(session.is_open().await);

        let _b = session.register("b").await;
        session.release("b").await;
        assert_eq!(session.unclosed_events().await.len(), 2);
        assert!(session.is_open().await);

        feed.push(frame(json!({"msg": "close_stream"})));
        feed.closed().await;
        assert!(session.unclosed_events().await.is_empty());
        assert!(!session.is_open().await);
    }
}
