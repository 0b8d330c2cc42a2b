use serde::{Deserialize, Serialize};

use crate::envelope::ResponseEnvelope;

/// Out-of-band session notifications broadcast to subscribers.
/// These never affect request outcomes; delivery is best-effort and a
/// lagging subscriber simply misses events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// A transport was established (authentication may still be pending).
    #[serde(rename = "opened")]
    Opened,

    /// The transport is gone: peer close, failure teardown, or local close.
    /// On a failure this follows the matching `TransportError`.
    #[serde(rename = "closed")]
    Closed,

    /// A low-level transport failure.
    #[serde(rename = "transport_error")]
    TransportError { message: String },

    /// A partial-tagged response that matched no pending request.
    #[serde(rename = "partial")]
    Partial { envelope: ResponseEnvelope },
}

impl SessionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::TransportError { .. } => "transport_error",
            Self::Partial { .. } => "partial",
        }
    }
}
