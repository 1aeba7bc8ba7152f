use faderproto::{DecodeError, Envelope, EnvelopeError, PatternError};

/// Connection-level failures. All of them end or prevent a session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to {endpoint}: {reason}")]
    Refused { endpoint: String, reason: String },

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Not connected")]
    NotConnected,

    #[error("Gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Everything a client call can fail with.
///
/// Clone so one failed wire request can be reported to every caller waiting
/// on the same subscription.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] EnvelopeError),

    #[error("Subscription refused ({code}): {message}")]
    Subscription { code: String, message: String },

    #[error("Request refused ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Metering decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] PatternError),

    #[error("Client is closed")]
    Closed,
}

impl LinkError {
    pub fn not_connected() -> Self {
        LinkError::Connection(ConnectionError::NotConnected)
    }

    pub fn connection_lost() -> Self {
        LinkError::Connection(ConnectionError::ConnectionLost)
    }

    pub fn transport(e: impl std::fmt::Display) -> Self {
        LinkError::Connection(ConnectionError::Transport(e.to_string()))
    }

    /// True for failures that say nothing about the request itself.
    pub fn is_connection(&self) -> bool {
        matches!(self, LinkError::Connection(_) | LinkError::Closed)
    }

    pub(crate) fn unexpected_reply(reply: &Envelope) -> Self {
        LinkError::Protocol(EnvelopeError::BodyShape {
            method: reply.method,
            path: reply.path.clone(),
            reason: "unexpected reply body".into(),
        })
    }
}
