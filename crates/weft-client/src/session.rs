//! The session actor: owns the transport, the correlation table, and the
//! connection lifecycle. Callers reach it only through its command channel.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, Interval};
use tracing::{debug, info, warn};

use weft_core::config::{CallOptions, Credentials, PartialPolicy, SessionConfig};
use weft_core::envelope::{RequestEnvelope, ResponseEnvelope, AUTH_KIND};
use weft_core::errors::{ClientError, Result};
use weft_core::events::SessionEvent;

use crate::correlation::{CallReply, CorrelationTable, PendingRequest};
use crate::transport::{Connector, Transport, TransportEvent};

/// Commands accepted by the session task.
pub(crate) enum Command {
    Call {
        kind: String,
        payload: Map<String, Value>,
        options: CallOptions,
        reply: CallReply,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Idle,
    Connecting,
    Authenticating,
    Ready,
    Closing,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

type ConnectOutcome = Result<Box<dyn Transport>>;

/// One wake-up of the actor loop.
enum Wake {
    Command(Option<Command>),
    Connected(ConnectOutcome),
    Transport(TransportEvent),
    PingDue,
    RetryDue,
    TimeoutDue,
}

/// Spawns the session task. Returns the command channel, the event
/// broadcaster, and a receiver that resolves once the first handshake
/// settles.
pub(crate) fn spawn(
    url: String,
    credentials: Credentials,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
) -> (
    mpsc::Sender<Command>,
    broadcast::Sender<SessionEvent>,
    oneshot::Receiver<Result<()>>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
    let (ready_tx, ready_rx) = oneshot::channel();
    let actor = SessionActor {
        url,
        credentials,
        config,
        connector,
        events: event_tx.clone(),
        table: CorrelationTable::new(),
        state: SessionState::Idle,
        transport: None,
        connect_rx: None,
        ping: None,
        alive: false,
        attempts: 0,
        next_id: 0,
        retry_at: None,
        connect_waiter: Some(ready_tx),
        close_waiters: Vec::new(),
        close_target: SessionState::Closed,
        cmd_open: true,
        exiting: false,
    };
    tokio::spawn(actor.run(cmd_rx));
    (cmd_tx, event_tx, ready_rx)
}

struct SessionActor {
    url: String,
    credentials: Credentials,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    events: broadcast::Sender<SessionEvent>,
    table: CorrelationTable,
    state: SessionState,
    /// At most one live connection; always cleared before a new dial starts.
    transport: Option<Box<dyn Transport>>,
    connect_rx: Option<oneshot::Receiver<ConnectOutcome>>,
    ping: Option<Interval>,
    alive: bool,
    attempts: u32,
    next_id: u64,
    retry_at: Option<Instant>,
    connect_waiter: Option<oneshot::Sender<Result<()>>>,
    close_waiters: Vec<oneshot::Sender<()>>,
    /// Where a graceful close lands: `Closed` for shutdown, `Idle` when a
    /// rejected handshake parks the session instead.
    close_target: SessionState,
    cmd_open: bool,
    exiting: bool,
}

impl SessionActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        self.start_connect();
        while !self.exiting {
            let wake = tokio::select! {
                cmd = cmd_rx.recv(), if self.cmd_open => Wake::Command(cmd),
                outcome = Self::connect_done(&mut self.connect_rx) => Wake::Connected(outcome),
                event = Self::transport_event(&mut self.transport) => Wake::Transport(event),
                _ = Self::tick(&mut self.ping) => Wake::PingDue,
                _ = Self::sleep_opt(self.retry_at) => Wake::RetryDue,
                _ = Self::sleep_opt(self.table.next_deadline()) => Wake::TimeoutDue,
            };
            match wake {
                Wake::Command(Some(Command::Call { kind, payload, options, reply })) => {
                    self.handle_call(kind, payload, options, reply).await;
                }
                Wake::Command(Some(Command::Close { reply })) => {
                    self.handle_close(Some(reply)).await;
                }
                Wake::Command(None) => {
                    debug!("all handles dropped, shutting down");
                    self.cmd_open = false;
                    self.handle_close(None).await;
                }
                Wake::Connected(outcome) => self.handle_connected(outcome).await,
                Wake::Transport(event) => self.handle_transport(event).await,
                Wake::PingDue => self.handle_ping_due().await,
                Wake::RetryDue => {
                    self.retry_at = None;
                    self.start_connect();
                }
                Wake::TimeoutDue => {
                    let expired = self.table.expire_due(Instant::now());
                    if expired > 0 {
                        debug!(expired, "request deadlines passed");
                    }
                }
            }
        }
        debug!("session task exiting");
    }

    // Select-arm helpers. Each one parks forever when its source is absent,
    // so the loop only wakes for things that can actually happen.

    async fn connect_done(rx: &mut Option<oneshot::Receiver<ConnectOutcome>>) -> ConnectOutcome {
        match rx.as_mut() {
            Some(rx) => match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(ClientError::Transport("dial task dropped".into())),
            },
            None => std::future::pending().await,
        }
    }

    async fn transport_event(transport: &mut Option<Box<dyn Transport>>) -> TransportEvent {
        match transport.as_mut() {
            Some(transport) => transport.next_event().await,
            None => std::future::pending().await,
        }
    }

    async fn tick(ping: &mut Option<Interval>) {
        match ping.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    async fn sleep_opt(at: Option<Instant>) {
        match at {
            Some(at) => time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }

    /// Starts a dial on a helper task unless a link already exists. The
    /// result comes back through `connect_rx` so queued deadlines keep
    /// firing while the dial is in flight.
    fn start_connect(&mut self) {
        if self.transport.is_some() || self.connect_rx.is_some() {
            debug!("dial skipped, a link is already present");
            return;
        }
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        if self.table.is_empty() {
            // Fresh cycle: ids restart only when no queued id could collide.
            self.next_id = 0;
        }
        self.state = SessionState::Connecting;
        let (tx, rx) = oneshot::channel();
        self.connect_rx = Some(rx);
        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        debug!(url = %url, attempt = self.attempts + 1, "dialing");
        tokio::spawn(async move {
            let outcome = connector.connect(&url).await;
            if let Err(outcome) = tx.send(outcome) {
                // The session moved on while we dialed; a connection that
                // won the race anyway must not stay open.
                if let Ok(mut transport) = outcome {
                    transport.close().await;
                }
            }
        });
    }

    async fn handle_connected(&mut self, outcome: ConnectOutcome) {
        self.connect_rx = None;
        match outcome {
            Ok(mut transport) => {
                if self.state != SessionState::Connecting {
                    transport.close().await;
                    return;
                }
                self.transport = Some(transport);
                self.attempts = 0;
                self.alive = true;
                self.state = SessionState::Authenticating;
                self.ping = Some(time::interval_at(
                    Instant::now() + self.config.ping_interval,
                    self.config.ping_interval,
                ));
                let _ = self.events.send(SessionEvent::Opened);
                info!(url = %self.url, "connected, authenticating");
                self.send_auth().await;
            }
            Err(e) => {
                self.attempts += 1;
                warn!(error = %e, attempts = self.attempts, "dial failed");
                let _ = self.events.send(SessionEvent::TransportError { message: e.to_string() });
                self.retry_or_fail(e);
            }
        }
    }

    async fn send_auth(&mut self) {
        let id = self.next_id;
        self.next_id += 1;
        let mut payload = Map::new();
        payload.insert("apiKey".into(), Value::String(self.credentials.api_key.clone()));
        payload.insert(
            "apiSecret".into(),
            Value::String(self.credentials.expose_secret().to_string()),
        );
        let envelope = RequestEnvelope::new(AUTH_KIND, id, payload);
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "handshake frame could not be encoded");
                self.lose_transport(e.to_string());
                return;
            }
        };
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.send(json).await {
            warn!(error = %e, "handshake send failed");
            self.lose_transport(e.to_string());
        } else {
            debug!(id, "authentication request sent");
        }
    }

    async fn handle_call(
        &mut self,
        kind: String,
        payload: Map<String, Value>,
        options: CallOptions,
        reply: CallReply,
    ) {
        // A teardown that parks the session back at Idle still accepts
        // calls; they queue like any other pre-Ready request. Only a real
        // shutdown refuses them.
        let shutting_down = self.state == SessionState::Closed
            || (self.state == SessionState::Closing && self.close_target == SessionState::Closed);
        if shutting_down {
            let _ = reply.send(Err(ClientError::SessionClosed));
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        if options.cancel_pending {
            let cancelled = self.table.cancel_kind(&kind, id);
            if cancelled > 0 {
                debug!(kind = %kind, cancelled, new_id = id, "superseded pending requests");
            }
        }
        let timeout = options.timeout.unwrap_or(self.config.request_timeout);
        let deadline = Instant::now() + timeout;
        let envelope = RequestEnvelope::new(kind.clone(), id, payload);
        self.table.register(PendingRequest::new(envelope, reply, deadline));
        if self.state == SessionState::Ready {
            self.transmit(&kind, id).await;
        } else {
            debug!(kind = %kind, id, state = %self.state, "queued until the session is ready");
        }
    }

    /// Sends one registered request. A failure resolves that request alone
    /// and leaves the connection and every other pending request in place.
    async fn transmit(&mut self, kind: &str, id: u64) {
        let Some(json) = self.table.request_json(kind, id) else {
            return;
        };
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.send(json).await {
            warn!(kind = %kind, id, error = %e, "frame send failed");
            self.table.resolve(kind, id, Err(e));
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Pong => {
                self.alive = true;
            }
            TransportEvent::Message(text) => self.demux(text).await,
            TransportEvent::Closed => {
                if self.state == SessionState::Closing {
                    self.finish_close();
                } else {
                    info!("connection closed");
                    let _ = self.events.send(SessionEvent::Closed);
                    self.lose_transport("connection closed".to_string());
                }
            }
            TransportEvent::Error(message) => {
                let _ = self.events.send(SessionEvent::TransportError { message: message.clone() });
                if self.state == SessionState::Closing {
                    // A broken link cannot finish the close handshake.
                    self.finish_close();
                } else {
                    warn!(error = %message, "transport failed");
                    let _ = self.events.send(SessionEvent::Closed);
                    self.lose_transport(message);
                }
            }
        }
    }

    /// Drops a dead link, then reconnects or fails per configuration.
    fn lose_transport(&mut self, reason: String) {
        self.ping = None;
        self.alive = false;
        self.transport = None;
        self.retry_or_fail(ClientError::Transport(reason));
    }

    fn retry_or_fail(&mut self, err: ClientError) {
        if self.config.reconnect {
            self.state = SessionState::Idle;
            self.retry_at = Some(Instant::now() + self.config.retry_interval);
            debug!(
                retry_in = ?self.config.retry_interval,
                pending = self.table.len(),
                "reconnect scheduled"
            );
        } else {
            if let Some(waiter) = self.connect_waiter.take() {
                let _ = waiter.send(Err(err.clone()));
            }
            let drained = self.table.drain(&err);
            if drained > 0 {
                warn!(drained, "failed pending requests, reconnection disabled");
            }
            self.state = SessionState::Closed;
            self.exiting = true;
        }
    }

    async fn demux(&mut self, text: String) {
        let envelope: ResponseEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "dropping unparseable frame");
                return;
            }
        };
        if envelope.request_type == AUTH_KIND {
            self.handle_auth_response(envelope).await;
            return;
        }
        let kind = envelope.request_type.clone();
        let id = envelope.request_id;
        if self.table.contains(&kind, id) {
            let outcome = if envelope.is_ok() {
                Ok(envelope)
            } else {
                Err(ClientError::from_response(&envelope))
            };
            self.table.resolve(&kind, id, outcome);
        } else if envelope.is_partial() {
            self.surface_partial(envelope);
        } else {
            debug!(kind = %kind, id, "dropping stale response");
        }
    }

    fn surface_partial(&mut self, envelope: ResponseEnvelope) {
        let emit = match self.config.partial_policy {
            PartialPolicy::Always => true,
            PartialPolicy::PendingKindOnly => self.table.has_kind(&envelope.request_type),
            PartialPolicy::Ignore => false,
        };
        if emit {
            debug!(kind = %envelope.request_type, id = envelope.request_id, "partial notification");
            let _ = self.events.send(SessionEvent::Partial { envelope });
        } else {
            debug!(kind = %envelope.request_type, id = envelope.request_id, "dropping unmatched partial");
        }
    }

    async fn handle_auth_response(&mut self, envelope: ResponseEnvelope) {
        if self.state != SessionState::Authenticating {
            debug!(state = %self.state, "dropping auth response outside the handshake");
            return;
        }
        if envelope.is_ok() {
            self.state = SessionState::Ready;
            info!(message = envelope.primary_message(), "authenticated");
            if let Some(waiter) = self.connect_waiter.take() {
                let _ = waiter.send(Ok(()));
            }
            self.replay_queued().await;
        } else {
            let err = ClientError::AuthenticationFailed(envelope.primary_message().to_string());
            warn!(
                code = envelope.status_code,
                message = envelope.primary_message(),
                "authentication rejected"
            );
            if let Some(waiter) = self.connect_waiter.take() {
                let _ = waiter.send(Err(err.clone()));
            }
            self.table.drain(&err);
            self.ping = None;
            self.alive = false;
            // Bad credentials stay bad: park instead of redialing.
            if let Some(transport) = self.transport.as_mut() {
                self.state = SessionState::Closing;
                self.close_target = SessionState::Idle;
                transport.close().await;
            } else {
                self.state = SessionState::Idle;
            }
        }
    }

    /// Re-sends everything still pending, each kind in submission order.
    /// A send failure resolves only that entry and replay continues.
    async fn replay_queued(&mut self) {
        let total = self.table.len();
        if total == 0 {
            return;
        }
        let mut failed = 0;
        for kind in self.table.kinds() {
            for id in self.table.ids_in_order(&kind) {
                let Some(json) = self.table.request_json(&kind, id) else {
                    continue;
                };
                let Some(transport) = self.transport.as_mut() else {
                    return;
                };
                if let Err(e) = transport.send(json).await {
                    debug!(kind = %kind, id, error = %e, "replay send failed");
                    self.table.resolve(&kind, id, Err(e));
                    failed += 1;
                }
            }
        }
        info!(replayed = total - failed, failed, "flushed queued requests");
    }

    async fn handle_ping_due(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if !self.alive {
            debug!("no keepalive acknowledgment since the last probe");
        }
        self.alive = false;
        if let Err(e) = transport.ping().await {
            debug!(error = %e, "keepalive probe failed");
        }
    }

    async fn handle_close(&mut self, reply: Option<oneshot::Sender<()>>) {
        match self.state {
            SessionState::Closed => {
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            SessionState::Closing => {
                // An explicit close during a handshake teardown upgrades it
                // to a full shutdown.
                self.close_target = SessionState::Closed;
                self.table.drain(&ClientError::Closing);
                if let Some(reply) = reply {
                    self.close_waiters.push(reply);
                }
            }
            _ => {
                info!(pending = self.table.len(), "closing session");
                self.ping = None;
                self.alive = false;
                self.retry_at = None;
                self.connect_rx = None;
                if let Some(waiter) = self.connect_waiter.take() {
                    let _ = waiter.send(Err(ClientError::Closing));
                }
                self.table.drain(&ClientError::Closing);
                if let Some(reply) = reply {
                    self.close_waiters.push(reply);
                }
                if let Some(transport) = self.transport.as_mut() {
                    self.state = SessionState::Closing;
                    self.close_target = SessionState::Closed;
                    transport.close().await;
                } else {
                    self.state = SessionState::Closed;
                    for waiter in self.close_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                    self.exiting = true;
                }
            }
        }
    }

    fn finish_close(&mut self) {
        self.transport = None;
        let _ = self.events.send(SessionEvent::Closed);
        self.state = self.close_target;
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        if self.state == SessionState::Closed {
            self.exiting = true;
        } else if !self.cmd_open {
            // Parked with no owner left; nothing can ever reach us again.
            self.state = SessionState::Closed;
            self.exiting = true;
        }
    }
}
