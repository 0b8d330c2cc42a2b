//! Wire envelopes for the request/response protocol.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status code the server uses for a successful operation.
pub const STATUS_OK: u16 = 200;

/// Reserved request kind for the authentication handshake.
pub const AUTH_KIND: &str = "auth";

/// Reserved request kind for the credential probe in unary mode.
pub const NOOP_KIND: &str = "noop";

/// Payload field that marks a response as an auxiliary partial rather
/// than the completion of a pending request.
pub const PARTIAL_FIELD: &str = "partType";

/// An outbound request frame.
///
/// `request_type` names the operation and `request_id` is the
/// session-scoped correlation id. All remaining payload fields are
/// flattened alongside them, so the frame on the wire is a single flat
/// JSON object.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Operation kind, e.g. `searchSymptom`.
    pub request_type: String,
    /// Correlation id assigned by the dispatcher.
    pub request_id: u64,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RequestEnvelope {
    pub fn new(request_type: impl Into<String>, request_id: u64, mut payload: Map<String, Value>) -> Self {
        // The dispatcher owns identity fields; caller copies are dropped.
        payload.remove("requestType");
        payload.remove("requestId");
        Self {
            request_type: request_type.into(),
            request_id,
            payload,
        }
    }

    /// Serializes the envelope to the text frame sent on the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// An inbound response frame.
///
/// Mirrors the request identity fields and adds the server's status.
/// `status_message` carries zero or more human-readable lines; the first
/// is the primary one.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub request_type: String,
    pub request_id: u64,
    pub status_code: u16,
    #[serde(default)]
    pub status_message: Vec<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ResponseEnvelope {
    pub fn is_ok(&self) -> bool {
        self.status_code == STATUS_OK
    }

    /// First status message, or the empty string when the server sent none.
    pub fn primary_message(&self) -> &str {
        self.status_message.first().map(String::as_str).unwrap_or("")
    }

    /// All status messages joined for display.
    pub fn joined_message(&self) -> String {
        self.status_message.join("; ")
    }

    /// True when the payload carries the partial marker field.
    pub fn is_partial(&self) -> bool {
        self.payload.contains_key(PARTIAL_FIELD)
    }
}
