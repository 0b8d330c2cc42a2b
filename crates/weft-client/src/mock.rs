//! Scripted transport doubles for exercising the session machinery
//! without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use weft_core::errors::{ClientError, Result};

use crate::transport::{Connector, Transport, TransportEvent};

/// What the next dial attempt should produce.
pub enum MockDial {
    /// Succeed; the test receives a [`MockLink`] for the new connection.
    Accept,
    /// Fail with the given reason.
    Refuse(String),
}

/// Scripted [`Connector`]: each dial consumes the next planned outcome.
/// An exhausted plan refuses further dials.
pub struct MockConnector {
    plan: Mutex<VecDeque<MockDial>>,
    links_tx: mpsc::UnboundedSender<MockLink>,
    attempts: AtomicUsize,
}

/// Receives one [`MockLink`] per accepted dial.
pub struct MockLinks {
    rx: mpsc::UnboundedReceiver<MockLink>,
}

impl MockConnector {
    pub fn scripted(plan: impl IntoIterator<Item = MockDial>) -> (Arc<Self>, MockLinks) {
        let (links_tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plan: Mutex::new(plan.into_iter().collect()),
            links_tx,
            attempts: AtomicUsize::new(0),
        });
        (connector, MockLinks { rx })
    }

    /// How many dials have been attempted so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Appends another planned outcome.
    pub fn push(&self, dial: MockDial) {
        self.plan.lock().push_back(dial);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.plan.lock().pop_front() {
            Some(MockDial::Accept) => {
                let (transport, link) = MockTransport::pair();
                let _ = self.links_tx.send(link);
                Ok(Box::new(transport))
            }
            Some(MockDial::Refuse(reason)) => Err(ClientError::Transport(reason)),
            None => Err(ClientError::Transport("no planned connection".into())),
        }
    }
}

impl MockLinks {
    /// Waits for the session to establish its next scripted connection.
    ///
    /// Panics if the connector is gone before another accept happens.
    pub async fn next(&mut self) -> MockLink {
        self.rx.recv().await.expect("no further connections were accepted")
    }
}

/// One scripted connection as seen by the session.
pub struct MockTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    fail_sends: Arc<AtomicBool>,
    pings: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn pair() -> (MockTransport, MockLink) {
        let (outbound, sent) = mpsc::unbounded_channel();
        let (inject, inbound) = mpsc::unbounded_channel();
        let fail_sends = Arc::new(AtomicBool::new(false));
        let pings = Arc::new(AtomicUsize::new(0));
        let transport = MockTransport {
            outbound,
            inbound,
            fail_sends: fail_sends.clone(),
            pings: pings.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        let link = MockLink { sent, inject, fail_sends, pings };
        (transport, link)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ClientError::SendFailed("scripted send failure".into()));
        }
        self.outbound
            .send(text)
            .map_err(|_| ClientError::SendFailed("link dropped".into()))
    }

    async fn ping(&mut self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        if self.closed.load(Ordering::SeqCst) {
            return TransportEvent::Closed;
        }
        match self.inbound.recv().await {
            Some(event) => event,
            None => TransportEvent::Closed,
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Test-side handle to one accepted connection: observe what the session
/// sent, and feed it transport events.
pub struct MockLink {
    sent: mpsc::UnboundedReceiver<String>,
    inject: mpsc::UnboundedSender<TransportEvent>,
    fail_sends: Arc<AtomicBool>,
    pings: Arc<AtomicUsize>,
}

impl MockLink {
    /// Next frame the session sent, parsed as JSON.
    ///
    /// Panics if the session drops the transport first.
    pub async fn sent_frame(&mut self) -> Value {
        let text = self.sent.recv().await.expect("transport dropped before a frame arrived");
        serde_json::from_str(&text).expect("session sent a non-JSON frame")
    }

    pub fn inject_message(&self, frame: Value) {
        let _ = self.inject.send(TransportEvent::Message(frame.to_string()));
    }

    pub fn inject_raw(&self, text: &str) {
        let _ = self.inject.send(TransportEvent::Message(text.to_string()));
    }

    pub fn inject_pong(&self) {
        let _ = self.inject.send(TransportEvent::Pong);
    }

    pub fn inject_closed(&self) {
        let _ = self.inject.send(TransportEvent::Closed);
    }

    pub fn inject_error(&self, message: &str) {
        let _ = self.inject.send(TransportEvent::Error(message.to_string()));
    }

    /// Makes subsequent sends on this connection fail (or succeed again).
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Keepalive probes observed on this connection.
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Reads the handshake frame and answers it successfully.
    /// Returns the frame for further assertions.
    pub async fn accept_auth(&mut self) -> Value {
        let frame = self.sent_frame().await;
        assert_eq!(frame["requestType"], "auth", "expected the handshake first");
        self.inject_message(json!({
            "requestType": "auth",
            "requestId": frame["requestId"],
            "statusCode": 200,
            "statusMessage": ["Authenticated"],
        }));
        frame
    }

    /// Reads the handshake frame and rejects it with `message`.
    pub async fn reject_auth(&mut self, message: &str) {
        let frame = self.sent_frame().await;
        assert_eq!(frame["requestType"], "auth", "expected the handshake first");
        self.inject_message(json!({
            "requestType": "auth",
            "requestId": frame["requestId"],
            "statusCode": 401,
            "statusMessage": [message],
        }));
    }
}
