//! Error taxonomy. Errors are values, never exceptions, across component
//! boundaries (spec §7) — the only panics raised by this crate are the two
//! programming-error conditions the spec calls out explicitly: access of a
//! consumed session handle, and `send` on a closed transport.

use thiserror::Error;
use wire_protocol::HandshakeErrorCode;

/// Reasons a session is deleted as unhealthy, surfaced via the
/// `protocolError` event (spec §4.8, §7).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// Inbound `seq` greater than local `ack` — a gap, not a duplicate.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    /// `Connection::send` returned `false` or encoding failed while
    /// `Connected`.
    #[error("message send failure: {0}")]
    MessageSendFailure(String),
    /// Handshake response was malformed, session-id mismatched, or
    /// reported a fatal (non-retriable) error code.
    #[error("handshake failed ({code:?}): {message}")]
    HandshakeFailed {
        code: Option<HandshakeErrorCode>,
        message: String,
    },
    /// `connect()` called with no attempt budget remaining.
    #[error("retries exceeded for peer {0}")]
    RetriesExceeded(String),
}

/// Local payload-size rejection (spec §4.1, §7). Carries the side that
/// detected it so the router can prefix the message the way spec §4.1
/// requires (`"client: …"` / `"server: …"`).
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{side}: payload exceeded maximum payload size size={size} max={max}")]
pub struct MaxPayloadSizeExceeded {
    pub side: Side,
    pub size: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Server => write!(f, "server"),
        }
    }
}

/// Error returned by `Transport::send`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SendError {
    #[error(transparent)]
    PayloadTooLarge(#[from] MaxPayloadSizeExceeded),
    #[error("transport is closed")]
    TransportClosed,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HandshakeFailure {
    #[error("malformed handshake request: {0}")]
    Malformed(String),
    #[error("malformed handshake metadata: {0}")]
    MalformedMetadata(String),
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
    #[error("rejected by custom handler: {0}")]
    RejectedByCustomHandler(String),
    #[error("session state mismatch")]
    SessionStateMismatch,
}

impl HandshakeFailure {
    pub fn code(&self) -> HandshakeErrorCode {
        match self {
            HandshakeFailure::Malformed(_) => HandshakeErrorCode::MalformedHandshake,
            HandshakeFailure::MalformedMetadata(_) => HandshakeErrorCode::MalformedHandshakeMeta,
            HandshakeFailure::VersionMismatch { .. } => HandshakeErrorCode::ProtocolVersionMismatch,
            HandshakeFailure::RejectedByCustomHandler(_) => {
                HandshakeErrorCode::RejectedByCustomHandler
            }
            HandshakeFailure::SessionStateMismatch => HandshakeErrorCode::SessionStateMismatch,
        }
    }
}
