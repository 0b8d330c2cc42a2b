use crate::envelope::ResponseEnvelope;

/// Typed error hierarchy for session and request failures.
/// Request-scoped errors resolve a single pending request; connection-scoped
/// errors describe the fate of the session itself.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    // Terminal for a connect attempt
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    // Request-scoped
    #[error("Server error ({code}): {message}")]
    Server { code: u16, message: String },
    #[error("HTTP error ({status}): {message}")]
    Http { status: u16, message: String },
    #[error("Request timed out: {id}, {kind}")]
    TimedOut { kind: String, id: u64 },
    #[error("Request ({kind}:{id}) cancelled by new request: {by}")]
    Superseded { kind: String, id: u64, by: u64 },
    #[error("Message send failed: {0}")]
    SendFailed(String),
    #[error("Request send failed: {0}")]
    RequestFailed(String),
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Invalid request parameters: {0}")]
    InvalidParams(String),

    // Connection-scoped
    #[error("Connection error: {0}")]
    Transport(String),
    #[error("Closing connection")]
    Closing,
    #[error("Session closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// True when the error resolves exactly one pending request and leaves
    /// the session usable.
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            Self::Server { .. }
                | Self::Http { .. }
                | Self::TimedOut { .. }
                | Self::Superseded { .. }
                | Self::SendFailed(_)
                | Self::RequestFailed(_)
                | Self::Malformed(_)
                | Self::InvalidParams(_)
        )
    }

    /// True when the error describes the connection or session as a whole.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::Transport(_) | Self::Closing | Self::SessionClosed
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::Server { .. } => "server_error",
            Self::Http { .. } => "http_error",
            Self::TimedOut { .. } => "timed_out",
            Self::Superseded { .. } => "superseded",
            Self::SendFailed(_) => "send_failed",
            Self::RequestFailed(_) => "request_failed",
            Self::Malformed(_) => "malformed_response",
            Self::InvalidParams(_) => "invalid_params",
            Self::Transport(_) => "transport",
            Self::Closing => "closing",
            Self::SessionClosed => "session_closed",
        }
    }

    /// Builds the server-rejection error for a non-OK response envelope.
    pub fn from_response(envelope: &ResponseEnvelope) -> Self {
        Self::Server {
            code: envelope.status_code,
            message: envelope.joined_message(),
        }
    }
}
