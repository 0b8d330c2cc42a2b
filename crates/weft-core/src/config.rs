use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

/// Tuning knobs for a duplex session.
///
/// Defaults match the protocol's published cadence: a keepalive probe every
/// 30s, reconnect attempts every 10s, and a 5s per-request timeout.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Keepalive probe cadence while a connection is up.
    pub ping_interval: Duration,
    /// Fixed delay between reconnect attempts.
    pub retry_interval: Duration,
    /// Default deadline for a request without a per-call override.
    pub request_timeout: Duration,
    /// Bound on a single dial attempt.
    pub connect_timeout: Duration,
    /// Whether the session redials after a lost connection or failed dial.
    pub reconnect: bool,
    /// Routing for partial-tagged responses with no pending match.
    pub partial_policy: PartialPolicy,
    /// Broadcast buffer for session events; lagging subscribers drop.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            retry_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            reconnect: true,
            partial_policy: PartialPolicy::Always,
            event_capacity: 256,
        }
    }
}

/// What to do with a partial-tagged response that matches no pending request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartialPolicy {
    /// Surface every unmatched partial as a session event.
    Always,
    /// Surface only while a request of the same kind is still pending.
    PendingKindOnly,
    /// Drop unmatched partials like any other stale response.
    Ignore,
}

/// Per-call overrides for `call`.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Deadline override; `None` uses the session default.
    pub timeout: Option<Duration>,
    /// Fail every pending request of the same kind before sending this one.
    pub cancel_pending: bool,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout), ..Self::default() }
    }

    pub fn superseding() -> Self {
        Self { cancel_pending: true, ..Self::default() }
    }
}

/// API credentials presented during the handshake (zeroized on drop,
/// redacted in Debug).
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    api_secret: SecretString,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: SecretString::from(api_secret.into()),
        }
    }

    pub fn expose_secret(&self) -> &str {
        self.api_secret.expose_secret()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}
