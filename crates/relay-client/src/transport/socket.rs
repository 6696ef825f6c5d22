//! # Socket Pump
//!
//! Bridges one tokio-tungstenite connection to a [`TransportIterator`].
//!
//! ```text
//! connect_async(url) ──► spawn(pump)
//!
//!   select! {
//!     consumer closed ──► send Close, stop
//!     outgoing text   ──► socket
//!     socket Text     ──► feed.push
//!     socket Ping     ──► Pong
//!     socket Close    ──► feed.close(clean = true)
//!     error / EOF     ──► feed.close(clean = false)
//!   }
//! ```

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{FrameFeed, TransportIterator};
use crate::error::{ClientError, ClientResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens a socket and spawns its pump.
pub async fn connect(url: &str) -> ClientResult<TransportIterator> {
    let (ws_stream, response) = connect_async(url).await.map_err(ClientError::from)?;
    debug!(%url, status = ?response.status(), "WebSocket handshake complete");
    info!(%url, "Socket connected");

    let (feed, outgoing, iterator) = TransportIterator::duplex();
    tokio::spawn(pump(ws_stream, feed, outgoing));
    Ok(iterator)
}

async fn pump(ws_stream: WsStream, feed: FrameFeed, mut outgoing: mpsc::UnboundedReceiver<String>) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = feed.closed() => {
                debug!("Consumer closed, closing socket");
                let _ = write.send(WsMessage::Close(None)).await;
                return;
            }

            Some(text) = outgoing.recv() => {
                if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                    warn!(?e, "Failed to send on socket");
                    feed.close(false);
                    return;
                }
            }

            incoming = read.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        feed.push(text.as_str());
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = write.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Socket closed by server");
                        feed.close(true);
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(?e, "Socket error");
                        feed.close(false);
                        return;
                    }
                    None => {
                        warn!("Socket ended without a close frame");
                        feed.close(false);
                        return;
                    }
                }
            }
        }
    }
}
