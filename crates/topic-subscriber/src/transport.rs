//! Duplex connection seam between the subscription state machine and the
//! network.
//!
//! A [`Transport`] opens one [`Connection`] per subscription attempt and
//! reports its lifecycle as [`TransportEvent`]s on a channel, so the state
//! machine never depends on a particular I/O runtime. [`WsTransport`] is the
//! production implementation over `tokio-tungstenite`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::Error;

/// Lifecycle events of a single connection, delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established and can carry frames.
    Open,
    /// An inbound frame.
    Frame(Vec<u8>),
    /// The connection is gone (closed by either side or failed to open).
    /// No further events follow.
    Closed,
}

/// Outbound half of a connection.
pub trait Connection: Send + Sync {
    /// Queue a text frame. Returns `false` if the frame could not be queued.
    fn send(&self, frame: String) -> bool;
    /// Close the connection. A `Closed` event follows.
    fn close(&self);
}

/// A freshly opened connection and its event stream.
pub struct Opened {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

pub trait Transport: Send + Sync + 'static {
    /// Start opening a connection to `endpoint`. Completion is reported as
    /// [`TransportEvent::Open`] or [`TransportEvent::Closed`].
    ///
    /// Called while the consumer's topic map is locked: must not block and
    /// must not call back into the [`Consumer`](crate::Consumer).
    fn open(&self, endpoint: &Url) -> Opened;
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

/// WebSocket transport; each connection runs as its own Tokio task.
///
/// [`Transport::open`] must be called from within a Tokio runtime.
#[derive(Debug, Clone)]
pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Transport for WsTransport {
    fn open(&self, endpoint: &Url) -> Opened {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(run_connection(
            endpoint.clone(),
            self.connect_timeout,
            event_tx,
            outbound_rx,
            cancel.clone(),
        ));

        Opened {
            connection: Arc::new(WsConnection {
                outbound: outbound_tx,
                cancel,
            }),
            events,
        }
    }
}

struct WsConnection {
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl Connection for WsConnection {
    fn send(&self, frame: String) -> bool {
        !self.cancel.is_cancelled() && self.outbound.send(frame).is_ok()
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_connection(
    endpoint: Url,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let connect = tokio::time::timeout(
        connect_timeout,
        tokio_tungstenite::connect_async(endpoint.as_str()),
    );
    let ws = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = events.send(TransportEvent::Closed);
            return;
        }
        result = connect => match result {
            Ok(Ok((ws, _resp))) => ws,
            Ok(Err(e)) => {
                let e = Error::from(e);
                tracing::warn!(%endpoint, "Connect failed: {e}");
                let _ = events.send(TransportEvent::Closed);
                return;
            }
            Err(_) => {
                tracing::warn!(%endpoint, "Connect timed out");
                let _ = events.send(TransportEvent::Closed);
                return;
            }
        }
    };

    tracing::debug!(%endpoint, "WebSocket connected");
    let (mut ws_write, mut ws_read) = ws.split();
    if events.send(TransportEvent::Open).is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        let _ = events.send(TransportEvent::Frame(text.as_str().as_bytes().to_vec()));
                    }
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        let _ = events.send(TransportEvent::Frame(data.to_vec()));
                    }
                    Some(Ok(tungstenite::Message::Close(_))) => {
                        tracing::debug!(%endpoint, "Close frame received");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ignore ping, pong and raw frames
                    }
                    Some(Err(e)) => {
                        tracing::warn!(%endpoint, "WebSocket error: {e}");
                        break;
                    }
                    None => {
                        tracing::debug!(%endpoint, "WebSocket stream ended");
                        break;
                    }
                }
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = ws_write.send(tungstenite::Message::Text(frame.into())).await {
                    tracing::warn!(%endpoint, "WebSocket send failed: {e}");
                    break;
                }
            }

            _ = cancel.cancelled() => {
                let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                break;
            }
        }
    }

    cancel.cancel();
    let _ = events.send(TransportEvent::Closed);
}
