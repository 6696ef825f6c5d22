//! # Submission Engine
//!
//! A [`Submission`] is one remote call, surfaced as a pull-based sequence of
//! [`SubmissionEvent`]s. Nothing touches the network until the first
//! `next()`; every transition after that happens inside `next()`, so frames
//! that arrive while nobody is pulling wait in the transport buffer.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Submission State Machine                          │
//! │                                                                         │
//! │  Init ──► status(pending) ──► Connect                                  │
//! │                                  │                                      │
//! │        ┌──────────────┬─────────┼──────────────┬──────────────┐        │
//! │        ▼              ▼         ▼              ▼              │        │
//! │   skip queue        ws        sse (v0)     sse_v1..v3         │        │
//! │   POST /run/..   socket     GET /queue/  POST /queue/join     │        │
//! │        │         /queue/join   join      + shared stream      │        │
//! │        │              └─────────┴──────────────┘              │        │
//! │        │                        ▼                             │        │
//! │        │                    Streaming ◄── frame ──► adapter   │        │
//! │        │                        │                             │        │
//! │        └──────────────► Done ◄──┘ complete / error / close    │        │
//! │                                                                         │
//! │  cancel(): status(complete) + POST /reset     destroy(): silent end    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//! - Exactly one terminal status (`complete` or `error`), always last.
//! - Internal failures become an `error` status; `next()` never panics or
//!   returns an error.
//! - Finishing closes the transport and releases the shared-stream route.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::Stream;
use relay_core::{
    CoreError, EventContext, MessageKind, NormalizedMessage, Output, Payload, Protocol,
    ResolvedEndpoint, Stage, Status, SubmissionEvent, WireAdapter, WireFrame, QUEUE_FULL_MSG,
    UNEXPECTED_ERROR_MSG,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::authorization::elevated_headers;
use crate::client::ClientInner;
use crate::connector::Headers;
use crate::error::ClientResult;
use crate::transport::{Frame, TransportIterator};

// =============================================================================
// Abort Signalling
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AbortKind {
    None = 0,
    Cancel = 1,
    Destroy = 2,
}

impl AbortKind {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AbortKind::Cancel,
            2 => AbortKind::Destroy,
            _ => AbortKind::None,
        }
    }
}

/// State a [`SubmissionHandle`] shares with its submission.
#[derive(Debug)]
struct AbortState {
    token: CancellationToken,

    /// First requested abort wins.
    kind: AtomicU8,

    event_id: OnceLock<String>,

    /// Shutdown token of the submission's transport, once connected.
    transport: OnceLock<CancellationToken>,
}

impl AbortState {
    fn new() -> Self {
        AbortState {
            token: CancellationToken::new(),
            kind: AtomicU8::new(AbortKind::None as u8),
            event_id: OnceLock::new(),
            transport: OnceLock::new(),
        }
    }

    /// Records `kind` and trips both tokens. Returns false if an abort was
    /// already requested.
    fn request(&self, kind: AbortKind) -> bool {
        let first = self
            .kind
            .compare_exchange(AbortKind::None as u8, kind as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.token.cancel();
        if let Some(transport) = self.transport.get() {
            transport.cancel();
        }
        first
    }

    fn kind(&self) -> AbortKind {
        AbortKind::from_u8(self.kind.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Submission
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Connect,
    Streaming,
    Done,
}

/// One in-flight call.
pub struct Submission {
    inner: Arc<ClientInner>,
    ctx: EventContext,
    endpoint: ResolvedEndpoint,
    payload: Payload,
    protocol: Protocol,
    adapter: &'static dyn WireAdapter,
    skip_queue: bool,

    phase: Phase,
    outbox: VecDeque<SubmissionEvent>,
    transport: Option<TransportIterator>,
    event_id: Option<String>,
    last_stage: Option<Stage>,

    /// Set once a terminal status has been queued.
    complete: bool,

    abort: Arc<AbortState>,
}

impl Submission {
    pub(crate) fn new(
        inner: Arc<ClientInner>,
        endpoint: ResolvedEndpoint,
        inputs: Vec<Value>,
        event_data: Option<Value>,
        trigger_id: Option<u64>,
    ) -> Self {
        let protocol = inner.app.protocol;
        let skip_queue = inner.app.is_skip_queue(endpoint.fn_index);
        let ctx = EventContext {
            endpoint: endpoint.route.clone(),
            fn_index: endpoint.fn_index,
            event_data: event_data.clone(),
            trigger_id,
        };
        let payload = Payload {
            data: inputs,
            event_data,
            fn_index: endpoint.fn_index,
            trigger_id,
        };

        Submission {
            inner,
            ctx,
            endpoint,
            payload,
            protocol,
            adapter: protocol.adapter(),
            skip_queue,
            phase: Phase::Init,
            outbox: VecDeque::new(),
            transport: None,
            event_id: None,
            last_stage: None,
            complete: false,
            abort: Arc::new(AbortState::new()),
        }
    }

    /// Handle for cancelling or destroying this submission from elsewhere.
    pub fn handle(&self) -> SubmissionHandle {
        SubmissionHandle {
            inner: self.inner.clone(),
            abort: self.abort.clone(),
            fn_index: self.endpoint.fn_index,
            protocol: self.protocol,
        }
    }

    pub fn fn_index(&self) -> usize {
        self.endpoint.fn_index
    }

    /// Event id assigned by the server, once known.
    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    /// Pulls the next event. `None` once the sequence has ended.
    pub async fn next(&mut self) -> Option<SubmissionEvent> {
        loop {
            if let Some(event) = self.outbox.pop_front() {
                return Some(event);
            }
            if self.phase == Phase::Done {
                return None;
            }
            if let Err(e) = self.advance().await {
                error!(
                    fn_index = self.ctx.fn_index,
                    endpoint = %self.ctx.endpoint,
                    error = %e,
                    retryable = e.is_retryable(),
                    protocol_error = e.is_protocol_error(),
                    "Submission failed"
                );
                self.finish_with(Status::error(UNEXPECTED_ERROR_MSG)).await;
            }
        }
    }

    /// Consumes the submission into a `Stream` of its events.
    pub fn into_stream(self) -> impl Stream<Item = SubmissionEvent> + Send {
        futures_util::stream::unfold(self, |mut submission| async move {
            submission.next().await.map(|event| (event, submission))
        })
    }

    /// Same as [`SubmissionHandle::cancel`].
    pub async fn cancel(&self) {
        self.handle().cancel().await;
    }

    /// Same as [`SubmissionHandle::destroy`].
    pub fn destroy(&self) {
        self.handle().destroy();
    }

    // =========================================================================
    // State Machine
    // =========================================================================

    async fn advance(&mut self) -> ClientResult<()> {
        if self.abort.token.is_cancelled() {
            self.on_abort().await;
            return Ok(());
        }

        match self.phase {
            Phase::Init => {
                debug!(
                    fn_index = self.ctx.fn_index,
                    protocol = %self.protocol,
                    "Submission started"
                );
                self.emit_status(Status::new(Stage::Pending).with_queue(!self.skip_queue));
                self.phase = Phase::Connect;
                Ok(())
            }
            Phase::Connect => {
                let token = self.abort.token.clone();
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Ok(()),
                    result = self.connect() => result,
                }
            }
            Phase::Streaming => self.read_frame().await,
            Phase::Done => Ok(()),
        }
    }

    async fn connect(&mut self) -> ClientResult<()> {
        if self.skip_queue {
            return self.run_direct().await;
        }
        match self.protocol {
            Protocol::Ws => self.open_socket().await,
            Protocol::Sse => self.open_event_stream().await,
            _ => self.join_queue().await,
        }
    }

    /// Queue-less call: one POST, one answer.
    async fn run_direct(&mut self) -> ClientResult<()> {
        let url = self.inner.http_url(&format!("/run{}", self.endpoint.route), &[])?;
        let body = self.payload.with_session(self.inner.session_hash());

        let reply = match self.inner.connector.post_json(&url, &body, &Headers::new()).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(%url, error = %e, "Direct call failed");
                self.finish_with(Status::broken_connection().with_queue(false)).await;
                return Ok(());
            }
        };

        if reply.is_ok() {
            let output: Output = serde_json::from_value(reply.body)?;
            self.emit_data(output.data);
            self.finish_with(Status {
                eta: output.average_duration,
                ..Status::new(Stage::Complete).with_queue(false)
            })
            .await;
        } else {
            let message = match reply.body.get("error") {
                Some(Value::String(message)) => message.clone(),
                Some(other) if !other.is_null() => other.to_string(),
                _ => UNEXPECTED_ERROR_MSG.to_string(),
            };
            warn!(%url, status = reply.status, "Direct call rejected");
            self.finish_with(Status::error(message).with_queue(false)).await;
        }
        Ok(())
    }

    async fn open_socket(&mut self) -> ClientResult<()> {
        let url = self.inner.ws_url("/queue/join", &self.inner.sign_params())?;
        match self.inner.connector.connect_socket(&url).await {
            Ok(transport) => {
                debug!(%url, "Socket open");
                self.attach(transport);
            }
            Err(e) => {
                warn!(%url, error = %e, "Socket connection failed");
                self.finish_with(Status::broken_connection()).await;
            }
        }
        Ok(())
    }

    /// v0: a dedicated event stream per submission.
    async fn open_event_stream(&mut self) -> ClientResult<()> {
        let mut params = vec![
            ("fn_index", self.ctx.fn_index.to_string()),
            ("session_hash", self.inner.session_hash().to_string()),
        ];
        params.extend(self.inner.sign_params());
        let url = self.inner.http_url("/queue/join", &params)?;

        match self.inner.connector.get_stream(&url, &Headers::new()).await {
            Ok(transport) => self.attach(transport),
            Err(e) => {
                warn!(%url, error = %e, "Event stream failed to open");
                self.finish_with(Status::broken_connection()).await;
            }
        }
        Ok(())
    }

    /// v1–v3: join the queue, then read from the shared stream.
    async fn join_queue(&mut self) -> ClientResult<()> {
        let headers = elevated_headers(
            self.inner.parent.as_deref(),
            &self.inner.config.authorization.parent_origin,
            &self.inner.app,
            &self.endpoint.dependency,
        )
        .await;
        let url = self.inner.http_url("/queue/join", &self.inner.sign_params())?;
        let body = self.payload.with_session(self.inner.session_hash());

        let reply = match self.inner.connector.post_json(&url, &body, &headers).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(%url, error = %e, "Queue join failed");
                self.finish_with(Status::broken_connection()).await;
                return Ok(());
            }
        };

        if reply.status == 503 {
            info!(fn_index = self.ctx.fn_index, "Queue full");
            self.finish_with(Status::error(QUEUE_FULL_MSG)).await;
            return Ok(());
        }
        if !reply.is_ok() {
            warn!(%url, status = reply.status, "Queue join rejected");
            self.finish_with(Status::broken_connection()).await;
            return Ok(());
        }

        let event_id = reply
            .body
            .get("event_id")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::MalformedFrame("join reply without event_id".into()))?
            .to_string();

        debug!(%event_id, fn_index = self.ctx.fn_index, "Joined queue");
        self.set_event_id(event_id.clone());
        let route = self.inner.session.register(&event_id).await;
        self.attach(route);
        Ok(())
    }

    fn attach(&mut self, transport: TransportIterator) {
        let _ = self.abort.transport.set(transport.shutdown_token());
        self.transport = Some(transport);
        self.phase = Phase::Streaming;
    }

    fn set_event_id(&mut self, event_id: String) {
        let _ = self.abort.event_id.set(event_id.clone());
        self.event_id = Some(event_id);
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    async fn read_frame(&mut self) -> ClientResult<()> {
        let token = self.abort.token.clone();
        let Some(transport) = self.transport.as_mut() else {
            self.finish().await;
            return Ok(());
        };

        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            frame = transport.next() => frame,
        };

        match frame {
            None if token.is_cancelled() => {
                self.on_abort().await;
                Ok(())
            }
            None => {
                self.finish().await;
                Ok(())
            }
            Some(Frame::Closed { clean }) => match self.adapter.normalize_close(clean) {
                Some(message) => self.handle_message(message).await,
                None => {
                    debug!(fn_index = self.ctx.fn_index, "Transport closed");
                    self.finish().await;
                    Ok(())
                }
            },
            Some(Frame::Text(text)) => {
                let frame = WireFrame::from_json(&text)?;
                debug!(fn_index = self.ctx.fn_index, msg = %frame.msg, "Frame received");
                if frame.is_close_stream() {
                    self.finish().await;
                    return Ok(());
                }
                let message = self.adapter.normalize(&frame, self.last_stage)?;
                self.handle_message(message).await
            }
        }
    }

    async fn handle_message(&mut self, mut message: NormalizedMessage) -> ClientResult<()> {
        match message.kind {
            MessageKind::Hash => {
                if self.adapter.answers(MessageKind::Hash) {
                    self.send(json!({
                        "fn_index": self.ctx.fn_index,
                        "session_hash": self.inner.session_hash(),
                    }))?;
                }
            }

            MessageKind::Data => {
                if self.adapter.answers(MessageKind::Data) {
                    if self.protocol.is_socket() {
                        self.send(self.payload.with_session(self.inner.session_hash()))?;
                    } else {
                        self.push_payload(message.event_id).await?;
                    }
                }
            }

            MessageKind::Log => {
                if let Some(line) = message.log {
                    self.outbox.push_back(self.ctx.log(line));
                }
            }

            MessageKind::Update => {
                if let Some(status) = message.status {
                    let failed = status.stage == Stage::Error;
                    self.emit_status(status);
                    if failed {
                        self.finish().await;
                    }
                }
            }

            MessageKind::Generating => {
                if self.protocol.uses_diffs() {
                    if let Some(event_id) = self.event_id.clone() {
                        let session = &self.inner.session;
                        if let Err(e) = session.reconstruct(&event_id, &mut message).await {
                            if e.is_diff_error() {
                                warn!(%event_id, error = %e, "Could not apply generating diff");
                            }
                            return Err(e.into());
                        }
                    }
                }
                let failed = message
                    .status
                    .as_ref()
                    .map(|s| s.stage == Stage::Error)
                    .unwrap_or(false);
                if let Some(status) = message.status {
                    self.emit_status(status);
                }
                if let Some(output) = message.output {
                    self.emit_data(output.data);
                }
                if failed {
                    self.finish().await;
                }
            }

            MessageKind::Complete => {
                if let Some(output) = message.output {
                    self.emit_data(output.data);
                }
                if let Some(status) = message.status {
                    self.emit_status(status);
                }
                self.finish().await;
            }

            MessageKind::UnexpectedError => {
                let status = message
                    .status
                    .unwrap_or_else(|| Status::error(UNEXPECTED_ERROR_MSG));
                self.finish_with(status).await;
            }

            MessageKind::Heartbeat | MessageKind::None => {}
        }
        Ok(())
    }

    fn send(&self, body: Value) -> ClientResult<()> {
        match &self.transport {
            Some(transport) => transport.send(body.to_string()),
            None => Ok(()),
        }
    }

    /// v0 `send_data`: POSTs the payload to the side channel.
    async fn push_payload(&mut self, event_id: Option<String>) -> ClientResult<()> {
        let event_id =
            event_id.ok_or_else(|| CoreError::MalformedFrame("send_data without event_id".into()))?;
        self.set_event_id(event_id.clone());

        let url = self.inner.http_url("/queue/data", &[])?;
        let body = self.payload.with_event(self.inner.session_hash(), &event_id);

        match self.inner.connector.post_json(&url, &body, &Headers::new()).await {
            Ok(reply) if reply.is_ok() => {}
            Ok(reply) => {
                warn!(%event_id, status = reply.status, "Payload rejected");
                self.finish_with(Status::broken_connection()).await;
            }
            Err(e) => {
                warn!(%event_id, error = %e, "Payload push failed");
                self.finish_with(Status::broken_connection()).await;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Emission & Teardown
    // =========================================================================

    /// Queues a status unless a terminal one was already queued.
    fn emit_status(&mut self, status: Status) {
        if self.complete {
            return;
        }
        self.complete = status.is_terminal();
        self.last_stage = Some(status.stage);
        self.outbox.push_back(self.ctx.status(status));
    }

    fn emit_data(&mut self, data: Vec<Value>) {
        if self.complete {
            return;
        }
        self.outbox.push_back(self.ctx.data(data));
    }

    async fn finish_with(&mut self, status: Status) {
        self.emit_status(status);
        self.finish().await;
    }

    async fn finish(&mut self) {
        if self.phase == Phase::Done {
            return;
        }
        self.phase = Phase::Done;

        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        if let Some(event_id) = &self.event_id {
            if self.protocol.uses_shared_stream() {
                self.inner.session.release(event_id).await;
                self.inner.session.discard_diffs(event_id).await;
            }
        }
        debug!(fn_index = self.ctx.fn_index, event_id = ?self.event_id, "Submission finished");
    }

    async fn on_abort(&mut self) {
        if self.abort.kind() == AbortKind::Cancel {
            self.emit_status(Status::new(Stage::Complete).with_queue(false));
        }
        self.finish().await;
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        if self.phase == Phase::Done || !self.protocol.uses_shared_stream() {
            return;
        }
        let Some(event_id) = self.event_id.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            runtime.spawn(async move {
                inner.session.release(&event_id).await;
                inner.session.discard_diffs(&event_id).await;
            });
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cancels or destroys a submission from another task.
#[derive(Clone)]
pub struct SubmissionHandle {
    inner: Arc<ClientInner>,
    abort: Arc<AbortState>,
    fn_index: usize,
    protocol: Protocol,
}

impl SubmissionHandle {
    /// Stops the submission and asks the server to drop it.
    ///
    /// The event sequence ends with `status(complete)`. The `/reset` request
    /// is best effort; its failure is logged, never surfaced.
    pub async fn cancel(&self) {
        if !self.abort.request(AbortKind::Cancel) {
            return;
        }
        info!(fn_index = self.fn_index, "Cancelling submission");

        let event_id = self.abort.event_id.get().cloned();
        if let Some(event_id) = &event_id {
            if self.protocol.uses_shared_stream() {
                self.inner.session.release(event_id).await;
            }
        }

        let body = match &event_id {
            Some(event_id) if !self.protocol.is_socket() => json!({ "event_id": event_id }),
            _ => json!({
                "fn_index": self.fn_index,
                "session_hash": self.inner.session_hash(),
            }),
        };

        let reply = match self.inner.http_url("/reset", &[]) {
            Ok(url) => self.inner.connector.post_json(&url, &body, &Headers::new()).await,
            Err(e) => Err(e),
        };
        match reply {
            Ok(reply) if reply.is_ok() => debug!(fn_index = self.fn_index, "Reset accepted"),
            Ok(reply) => warn!(fn_index = self.fn_index, status = reply.status, "Reset rejected"),
            Err(e) => warn!(fn_index = self.fn_index, error = %e, "Reset request failed"),
        }
    }

    /// Ends the submission silently: no further events, no `/reset`.
    pub fn destroy(&self) {
        if self.abort.request(AbortKind::Destroy) {
            debug!(fn_index = self.fn_index, "Submission destroyed");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::ClientConfig;
    use crate::connector::HttpReply;
    use crate::error::ClientError;
    use crate::testing::{init_tracing, ScriptedConnector};
    use futures_util::StreamExt;
    use relay_core::{ApiInfo, AppConfig, Dependency, BROKEN_CONNECTION_MSG};

    fn client(
        protocol: Protocol,
        dependency: Dependency,
        connector: Arc<ScriptedConnector>,
    ) -> Client {
        let mut app = AppConfig::new("http://app.test", protocol);
        app.dependencies = vec![dependency];
        let mut api = ApiInfo::default();
        api.api_map.insert("predict".into(), 0);

        let mut config = ClientConfig::default();
        config.session.hash = "sess".into();

        Client::builder(app, api)
            .config(config)
            .connector(connector)
            .build()
            .unwrap()
    }

    async fn drain(submission: &mut Submission) -> Vec<SubmissionEvent> {
        let mut events = Vec::new();
        while let Some(event) = submission.next().await {
            events.push(event);
        }
        events
    }

    fn stages(events: &[SubmissionEvent]) -> Vec<Stage> {
        events.iter().filter_map(SubmissionEvent::stage).collect()
    }

    fn data(events: &[SubmissionEvent]) -> Vec<Vec<Value>> {
        events.iter().filter_map(|e| e.as_data().map(<[Value]>::to_vec)).collect()
    }

    fn frame(value: Value) -> String {
        value.to_string()
    }

    #[tokio::test]
    async fn test_diff_stream_predict() {
        init_tracing();
        let connector = Arc::new(ScriptedConnector::new());
        connector.reply("/queue/join", Ok(HttpReply::new(200, json!({"event_id": "evt"}))));
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));

        feed.push(frame(json!({"msg": "process_generating", "event_id": "evt", "success": true,
                               "output": {"data": ["processed:"]}})));
        feed.push(frame(json!({"msg": "process_generating", "event_id": "evt", "success": true,
                               "output": {"data": [[["append", [], " hi"]]]}})));
        feed.push(frame(json!({"msg": "process_completed", "event_id": "evt", "success": true,
                               "output": {"data": ["processed: hi"]}})));

        let client = client(Protocol::SseV2, Dependency::default(), connector.clone());
        let mut submission = client.submit("/predict", vec![json!("hi")], None, None).unwrap();
        let events = drain(&mut submission).await;

        assert_eq!(
            stages(&events),
            vec![Stage::Pending, Stage::Generating, Stage::Generating, Stage::Complete]
        );
        assert_eq!(
            data(&events),
            vec![
                vec![json!("processed:")],
                vec![json!("processed: hi")],
                vec![json!("processed: hi")],
            ]
        );
        assert!(events.last().unwrap().is_terminal());
        assert_eq!(submission.event_id(), Some("evt"));

        let joins = connector.posts_to("/queue/join");
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].body["data"], json!(["hi"]));
        assert_eq!(joins[0].body["session_hash"], json!("sess"));
    }

    #[tokio::test]
    async fn test_cancel_ends_with_complete_even_if_reset_fails() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.reply("/queue/join", Ok(HttpReply::new(200, json!({"event_id": "evt"}))));
        connector.reply("/reset", Err(ClientError::ConnectionFailed("refused".into())));
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));
        feed.push(frame(json!({"msg": "process_generating", "event_id": "evt", "success": true,
                               "output": {"data": ["partial"]}})));

        let client = client(Protocol::SseV2, Dependency::default(), connector.clone());
        let mut submission = client.submit("/predict", vec![json!("hi")], None, None).unwrap();

        assert_eq!(submission.next().await.unwrap().stage(), Some(Stage::Pending));
        assert_eq!(submission.next().await.unwrap().stage(), Some(Stage::Generating));
        assert!(submission.next().await.unwrap().as_data().is_some());

        let handle = submission.handle();
        handle.cancel().await;
        assert!(handle.is_aborted());

        let rest = drain(&mut submission).await;
        assert_eq!(stages(&rest), vec![Stage::Complete]);
        assert_eq!(rest[0].as_status().unwrap().queue, false);

        let resets = connector.posts_to("/reset");
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].body, json!({"event_id": "evt"}));

        // a second cancel does not reset again
        handle.cancel().await;
        assert_eq!(connector.posts_to("/reset").len(), 1);
    }

    #[tokio::test]
    async fn test_unclean_close_before_data() {
        let connector = Arc::new(ScriptedConnector::new());
        let (feed, _outgoing, socket) = TransportIterator::duplex();
        connector.socket(Ok(socket));
        feed.close(false);

        let client = client(Protocol::Ws, Dependency::default(), connector.clone());
        let mut submission = client.submit("/predict", vec![], None, None).unwrap();
        let events = drain(&mut submission).await;

        assert_eq!(stages(&events), vec![Stage::Pending, Stage::Error]);
        assert!(data(&events).is_empty());
        let status = events[1].as_status().unwrap();
        assert!(status.broken);
        assert_eq!(status.message.as_deref(), Some(BROKEN_CONNECTION_MSG));
    }

    #[tokio::test]
    async fn test_shared_stream_break_is_broken_connection() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.reply("/queue/join", Ok(HttpReply::new(200, json!({"event_id": "evt"}))));
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));
        feed.close(false);

        let client = client(Protocol::SseV3, Dependency::default(), connector);
        let mut submission = client.submit(0usize, vec![], None, None).unwrap();
        let events = drain(&mut submission).await;

        assert_eq!(stages(&events), vec![Stage::Pending, Stage::Error]);
        assert!(events[1].as_status().unwrap().broken);
    }

    #[tokio::test]
    async fn test_socket_handshake() {
        let connector = Arc::new(ScriptedConnector::new());
        let (feed, mut outgoing, socket) = TransportIterator::duplex();
        connector.socket(Ok(socket));
        feed.push(frame(json!({"msg": "send_hash"})));
        feed.push(frame(json!({"msg": "estimation", "rank": 2, "queue_size": 5, "rank_eta": 1.5})));
        feed.push(frame(json!({"msg": "send_data"})));
        feed.push(frame(
            json!({"msg": "process_completed", "success": true, "output": {"data": ["ok"]}}),
        ));

        let client = client(Protocol::Ws, Dependency::default(), connector.clone());
        let mut submission = client.submit("/predict", vec![json!(1)], None, Some(7)).unwrap();
        let events = drain(&mut submission).await;

        assert_eq!(stages(&events), vec![Stage::Pending, Stage::Pending, Stage::Complete]);
        let estimation = events[1].as_status().unwrap();
        assert_eq!(estimation.position, Some(2));
        assert_eq!(estimation.size, Some(5));
        assert_eq!(data(&events), vec![vec![json!("ok")]]);

        let hash: Value = serde_json::from_str(&outgoing.recv().await.unwrap()).unwrap();
        assert_eq!(hash, json!({"fn_index": 0, "session_hash": "sess"}));
        let payload: Value = serde_json::from_str(&outgoing.recv().await.unwrap()).unwrap();
        assert_eq!(payload["data"], json!([1]));
        assert_eq!(payload["trigger_id"], json!(7));

        assert_eq!(connector.socket_urls(), vec!["ws://app.test/queue/join".to_string()]);
    }

    #[tokio::test]
    async fn test_event_stream_v0_pushes_payload() {
        let connector = Arc::new(ScriptedConnector::new());
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));
        connector.reply("/queue/data", Ok(HttpReply::new(200, Value::Null)));
        feed.push(frame(json!({"msg": "send_data", "event_id": "e0"})));
        feed.push(frame(json!({"msg": "log", "log": "warming up", "level": "warning"})));
        feed.push(frame(
            json!({"msg": "process_completed", "success": true, "output": {"data": [3]}}),
        ));

        let client = client(Protocol::Sse, Dependency::default(), connector.clone());
        let inputs = vec![json!(1), json!(2)];
        let mut submission = client.submit("/predict", inputs, None, None).unwrap();
        let events = drain(&mut submission).await;

        assert_eq!(stages(&events), vec![Stage::Pending, Stage::Complete]);
        assert_eq!(data(&events), vec![vec![json!(3)]]);
        assert!(matches!(&events[1], SubmissionEvent::Log(log) if log.level == "warning"));

        assert_eq!(
            connector.stream_urls(),
            vec!["http://app.test/queue/join?fn_index=0&session_hash=sess".to_string()]
        );
        let pushes = connector.posts_to("/queue/data");
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].body["event_id"], json!("e0"));
        assert_eq!(pushes[0].body["data"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_queue_full() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.reply("/queue/join", Ok(HttpReply::new(503, Value::Null)));

        let client = client(Protocol::SseV2_1, Dependency::default(), connector.clone());
        let mut submission = client.submit("/predict", vec![], None, None).unwrap();
        let events = drain(&mut submission).await;

        assert_eq!(stages(&events), vec![Stage::Pending, Stage::Error]);
        assert_eq!(events[1].as_status().unwrap().message.as_deref(), Some(QUEUE_FULL_MSG));
        assert!(connector.stream_urls().is_empty());
    }

    #[tokio::test]
    async fn test_direct_call_skips_queue() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.reply(
            "/run/predict",
            Ok(HttpReply::new(200, json!({"data": ["x"], "average_duration": 0.5}))),
        );
        let unqueued = Dependency {
            queue: Some(false),
            zerogpu: None,
        };

        let client = client(Protocol::SseV3, unqueued, connector.clone());
        let events: Vec<_> = client
            .submit("/predict", vec![json!("in")], None, None)
            .unwrap()
            .into_stream()
            .collect()
            .await;

        assert_eq!(stages(&events), vec![Stage::Pending, Stage::Complete]);
        assert!(!events[0].as_status().unwrap().queue);
        assert_eq!(events[2].as_status().unwrap().eta, Some(0.5));
        assert_eq!(data(&events), vec![vec![json!("x")]]);
        assert!(connector.posts_to("/queue/join").is_empty());
    }

    #[tokio::test]
    async fn test_bad_diff_becomes_error_status() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.reply("/queue/join", Ok(HttpReply::new(200, json!({"event_id": "evt"}))));
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));
        feed.push(frame(json!({"msg": "process_generating", "event_id": "evt", "success": true,
                               "output": {"data": ["a"]}})));
        feed.push(frame(json!({"msg": "process_generating", "event_id": "evt", "success": true,
                               "output": {"data": [[["splice", [], "x"]]]}})));

        let client = client(Protocol::SseV3, Dependency::default(), connector);
        let mut submission = client.submit("/predict", vec![], None, None).unwrap();
        let events = drain(&mut submission).await;

        assert_eq!(stages(&events), vec![Stage::Pending, Stage::Generating, Stage::Error]);
        assert_eq!(
            events.last().unwrap().as_status().unwrap().message.as_deref(),
            Some(UNEXPECTED_ERROR_MSG)
        );
    }

    #[tokio::test]
    async fn test_server_error_has_no_data() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.reply("/queue/join", Ok(HttpReply::new(200, json!({"event_id": "evt"}))));
        let (feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));
        feed.push(frame(json!({"msg": "process_completed", "event_id": "evt", "success": false,
                               "output": {"error": "boom"}})));

        let client = client(Protocol::SseV1, Dependency::default(), connector);
        let mut submission = client.submit("/predict", vec![], None, None).unwrap();
        let events = drain(&mut submission).await;

        assert_eq!(stages(&events), vec![Stage::Pending, Stage::Error]);
        assert_eq!(events[1].as_status().unwrap().message.as_deref(), Some("boom"));
        assert!(data(&events).is_empty());
    }

    #[tokio::test]
    async fn test_destroy_is_silent() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.reply("/queue/join", Ok(HttpReply::new(200, json!({"event_id": "evt"}))));
        let (_feed, stream) = TransportIterator::channel();
        connector.stream(Ok(stream));

        let client = client(Protocol::SseV2, Dependency::default(), connector.clone());
        let mut submission = client.submit("/predict", vec![], None, None).unwrap();
        assert_eq!(submission.next().await.unwrap().stage(), Some(Stage::Pending));

        let handle = submission.handle();
        let puller = tokio::spawn(async move { drain(&mut submission).await });
        tokio::task::yield_now().await;
        handle.destroy();

        assert!(puller.await.unwrap().is_empty());
        assert!(connector.posts_to("/reset").is_empty());
    }

    #[tokio::test]
    async fn test_cancel_socket_resets_by_session() {
        let connector = Arc::new(ScriptedConnector::new());
        let (_feed, _outgoing, socket) = TransportIterator::duplex();
        connector.socket(Ok(socket));
        connector.reply("/reset", Ok(HttpReply::new(200, Value::Null)));

        let client = client(Protocol::Ws, Dependency::default(), connector.clone());
        let mut submission = client.submit("/predict", vec![], None, None).unwrap();
        assert_eq!(submission.next().await.unwrap().stage(), Some(Stage::Pending));

        submission.cancel().await;
        let rest = drain(&mut submission).await;
        assert_eq!(stages(&rest), vec![Stage::Complete]);

        let resets = connector.posts_to("/reset");
        assert_eq!(resets[0].body, json!({"fn_index": 0, "session_hash": "sess"}));
    }
}
