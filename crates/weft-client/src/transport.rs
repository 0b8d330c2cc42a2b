//! Connection seam: the session drives any duplex link through these traits.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use weft_core::errors::{ClientError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What a live connection reports back to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete inbound text frame.
    Message(String),
    /// Acknowledgment of an earlier keepalive probe.
    Pong,
    /// The connection ended (peer close, local close ack, or EOF).
    Closed,
    /// The connection failed and is no longer usable.
    Error(String),
}

/// A live duplex connection owned by exactly one session.
///
/// `next_event` must be cancel-safe; the session polls it inside a select
/// loop. After `Closed` or `Error` the transport must be dropped.
#[async_trait]
pub trait Transport: Send {
    /// Sends one text frame.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Sends a low-level keepalive probe.
    async fn ping(&mut self) -> Result<()>;

    /// Waits for the next inbound event.
    async fn next_event(&mut self) -> TransportEvent;

    /// Starts a graceful close. Completion is still reported through
    /// `next_event` as `Closed`.
    async fn close(&mut self);
}

/// Dials new transports. The production implementation speaks WebSocket;
/// tests substitute a scripted one.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}

/// WebSocket connector over `tokio-tungstenite` (TLS via rustls for wss).
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        let attempt = connect_async(url);
        let (ws, _) = tokio::time::timeout(self.connect_timeout, attempt)
            .await
            .map_err(|_| ClientError::Transport(format!("connect timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Box::new(WsTransport { ws }))
    }
}

struct WsTransport {
    ws: WsStream,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ClientError::SendFailed(e.to_string()))
    }

    async fn ping(&mut self) -> Result<()> {
        self.ws
            .send(Message::Ping(vec![].into()))
            .await
            .map_err(|e| ClientError::SendFailed(e.to_string()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Message(text.to_string()),
                Some(Ok(Message::Pong(_))) => return TransportEvent::Pong,
                Some(Ok(Message::Close(_))) => return TransportEvent::Closed,
                // The library answers pings itself; other frame types carry
                // nothing for this protocol.
                Some(Ok(other)) => {
                    debug!(frame = ?other, "ignoring non-text frame");
                }
                Some(Err(e)) => return TransportEvent::Error(e.to_string()),
                None => return TransportEvent::Closed,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "close frame send failed");
        }
    }
}
