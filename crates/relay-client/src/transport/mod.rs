//! # Transport Iterator
//!
//! Every connection a submission reads from, socket or event stream, is
//! exposed as one pull-based [`TransportIterator`].
//!
//! ## Ownership
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Transport Iterator                                │
//! │                                                                         │
//! │   spawned pump                         consumer                        │
//! │   ────────────                         ────────                        │
//! │   ┌───────────┐   Frame (FIFO)     ┌──────────────────┐                │
//! │   │ FrameFeed │ ─────────────────► │ TransportIterator│ ◄── next()     │
//! │   └─────┬─────┘                    │                  │                │
//! │         │         outgoing text    │                  │ ◄── send()     │
//! │   socket│ ◄─────────────────────── │                  │                │
//! │         │                          │                  │ ◄── close()    │
//! │         │   feed.closed() fires    └──────────────────┘     / drop     │
//! │         └── when the iterator closes or is dropped                     │
//! │             ──► pump closes the underlying connection                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//! - Frames that arrive before anyone asks are buffered in arrival order.
//! - `next()` waits until a frame arrives or the connection ends.
//! - The connection ending yields exactly one [`Frame::Closed`], then `None`.
//! - After [`TransportIterator::close`], `next()` yields `None` forever.

pub mod socket;
pub mod sse;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, ClientResult};

// =============================================================================
// Frame
// =============================================================================

/// One item pulled from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text payload (socket message or event-stream `data`).
    Text(String),

    /// The connection ended. `clean` is false for errors and aborted bodies.
    Closed { clean: bool },
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }
}

// =============================================================================
// Producer Side
// =============================================================================

/// Producer half, held by whatever pumps frames off the wire.
#[derive(Debug, Clone)]
pub struct FrameFeed {
    tx: mpsc::UnboundedSender<Frame>,
    shutdown: CancellationToken,
}

impl FrameFeed {
    /// Buffers a text frame. Returns false once the consumer has closed.
    pub fn push(&self, text: impl Into<String>) -> bool {
        !self.shutdown.is_cancelled() && self.tx.send(Frame::Text(text.into())).is_ok()
    }

    /// Announces the end of the connection.
    pub fn close(&self, clean: bool) {
        let _ = self.tx.send(Frame::Closed { clean });
    }

    /// Returns true if the consumer closed or dropped its iterator.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.shutdown.is_cancelled()
    }

    /// Resolves once the consumer closed or dropped its iterator.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.tx.closed() => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

// =============================================================================
// Consumer Side
// =============================================================================

/// Pull-based view of one connection.
#[derive(Debug)]
pub struct TransportIterator {
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    shutdown: CancellationToken,
    done: bool,
}

impl TransportIterator {
    /// Creates a receive-only iterator and its feed.
    pub fn channel() -> (FrameFeed, TransportIterator) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let iterator = TransportIterator {
            incoming: rx,
            outgoing: None,
            shutdown: shutdown.clone(),
            done: false,
        };
        (FrameFeed { tx, shutdown }, iterator)
    }

    /// Creates a full-duplex iterator, its feed and the receiver for text
    /// the consumer sends.
    pub fn duplex() -> (FrameFeed, mpsc::UnboundedReceiver<String>, TransportIterator) {
        let (feed, mut iterator) = Self::channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        iterator.outgoing = Some(out_tx);
        (feed, out_rx, iterator)
    }

    /// Pulls the next frame.
    ///
    /// A producer that disappears without announcing a close is reported as
    /// an unclean close.
    pub async fn next(&mut self) -> Option<Frame> {
        if self.done {
            return None;
        }

        let received = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            frame = self.incoming.recv() => Some(frame),
        };

        match received {
            None => {
                self.close();
                None
            }
            Some(Some(Frame::Closed { clean })) => {
                self.close();
                Some(Frame::Closed { clean })
            }
            Some(Some(frame)) => Some(frame),
            Some(None) => {
                self.close();
                Some(Frame::Closed { clean: false })
            }
        }
    }

    /// Sends text over a full-duplex connection.
    pub fn send(&self, text: impl Into<String>) -> ClientResult<()> {
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or_else(|| ClientError::ChannelError("Transport is receive-only".into()))?;
        outgoing
            .send(text.into())
            .map_err(|_| ClientError::ChannelError("Transport is closed".into()))
    }

    /// Terminates the iterator and tells the pump to drop the connection.
    ///
    /// Idempotent. Buffered frames are discarded.
    pub fn close(&mut self) {
        self.done = true;
        self.outgoing = None;
        self.incoming.close();
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.done || self.shutdown.is_cancelled()
    }

    /// Token that closes this transport from elsewhere, e.g. a cancel
    /// handle while nobody is pulling.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
