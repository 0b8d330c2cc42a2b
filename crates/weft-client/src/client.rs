//! Public entry point: one handle, two transports behind it.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};

use weft_core::config::{CallOptions, Credentials, SessionConfig};
use weft_core::envelope::ResponseEnvelope;
use weft_core::errors::{ClientError, Result};
use weft_core::events::SessionEvent;

use crate::session::{self, Command};
use crate::transport::{Connector, WsConnector};
use crate::unary::UnaryClient;

/// A connected client.
///
/// `http`/`https` endpoints get the stateless unary mode; anything else is
/// dialed as a persistent duplex stream with authentication, keepalive,
/// reconnection, and request replay. Both present the same call surface.
#[derive(Debug)]
pub struct Client {
    inner: ClientInner,
}

#[derive(Debug)]
enum ClientInner {
    Duplex(DuplexHandle),
    Unary(UnaryClient),
}

#[derive(Debug)]
struct DuplexHandle {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
}

impl Client {
    /// Establishes a session against `url` and waits for the handshake
    /// (duplex) or the credential probe (unary) to settle.
    pub async fn connect(
        url: impl Into<String>,
        credentials: Credentials,
        config: SessionConfig,
    ) -> Result<Self> {
        let url = url.into();
        if is_unary_endpoint(&url) {
            let unary = UnaryClient::connect(url, credentials, config).await?;
            return Ok(Self { inner: ClientInner::Unary(unary) });
        }
        let connector = Arc::new(WsConnector::new(config.connect_timeout));
        Self::connect_with(url, credentials, config, connector).await
    }

    /// Like [`Client::connect`], but with a caller-supplied dialer. This is
    /// the seam scripted transports plug into.
    pub async fn connect_with(
        url: impl Into<String>,
        credentials: Credentials,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let (cmd_tx, events, ready) = session::spawn(url.into(), credentials, config, connector);
        match ready.await {
            Ok(Ok(())) => Ok(Self { inner: ClientInner::Duplex(DuplexHandle { cmd_tx, events }) }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::SessionClosed),
        }
    }

    /// Issues one request and waits for its outcome. `params` must be a
    /// JSON object (or null for an empty payload).
    pub async fn call(&self, kind: &str, params: Value, options: CallOptions) -> Result<ResponseEnvelope> {
        match &self.inner {
            ClientInner::Duplex(handle) => {
                let payload = into_payload(params)?;
                let (tx, rx) = oneshot::channel();
                let command = Command::Call {
                    kind: kind.to_string(),
                    payload,
                    options,
                    reply: tx,
                };
                handle
                    .cmd_tx
                    .send(command)
                    .await
                    .map_err(|_| ClientError::SessionClosed)?;
                rx.await.map_err(|_| ClientError::SessionClosed)?
            }
            ClientInner::Unary(unary) => unary.call(kind, params, options).await,
        }
    }

    /// Shuts the session down. Safe in any state and idempotent; pending
    /// duplex requests fail with the closing error.
    pub async fn close(&self) -> Result<()> {
        match &self.inner {
            ClientInner::Duplex(handle) => {
                let (tx, rx) = oneshot::channel();
                if handle.cmd_tx.send(Command::Close { reply: tx }).await.is_err() {
                    // The session task is already gone.
                    return Ok(());
                }
                let _ = rx.await;
                Ok(())
            }
            ClientInner::Unary(unary) => {
                unary.close();
                Ok(())
            }
        }
    }

    /// Subscribes to out-of-band session events. A unary client's channel
    /// is valid but never fires.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        match &self.inner {
            ClientInner::Duplex(handle) => handle.events.subscribe(),
            ClientInner::Unary(unary) => unary.subscribe(),
        }
    }
}

fn is_unary_endpoint(url: &str) -> bool {
    // get() instead of indexing: byte 4 may fall inside a multibyte
    // character, and a malformed URL must never panic the caller.
    url.get(..4).is_some_and(|prefix| prefix.eq_ignore_ascii_case("http"))
}

pub(crate) fn into_payload(params: Value) -> Result<Map<String, Value>> {
    match params {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(ClientError::InvalidParams(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}
