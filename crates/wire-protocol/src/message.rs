//! Wire message model: `TransportMessage` plus the control payloads carried
//! over it (`ACK`, `CLOSE`, `HANDSHAKE_REQ`, `HANDSHAKE_RESP`).
//!
//! All of these types are bit-exact wire contracts — field names are
//! `camelCase` on the wire via `serde(rename_all)` so a JSON codec round
//! trips against any peer speaking the same protocol version, regardless of
//! which language implements it.

use serde::{Deserialize, Serialize};

/// Control-flag bits carried in [`TransportMessage::control_flags`].
///
/// `StreamOpen` requires `service_name` + `procedure_name` + a unique
/// `stream_id`. `Ack`-only messages carry `stream_id = "heartbeat"` and a
/// `{"type":"ACK"}` control payload, and MUST NOT be delivered to the
/// router. `StreamClosed` on stream/subscription kinds means "discard
/// payload; end of stream".
pub mod control_flags {
    pub const ACK: u8 = 0x01;
    pub const STREAM_OPEN: u8 = 0x02;
    pub const STREAM_ABORT: u8 = 0x04;
    pub const STREAM_CLOSED: u8 = 0x08;
    pub const STREAM_CLOSE_REQUEST: u8 = 0x10;
}

/// The stream id reserved for heartbeat ack messages.
pub const HEARTBEAT_STREAM_ID: &str = "heartbeat";

/// Current protocol version string, carried in every `HANDSHAKE_REQ`.
pub const PROTOCOL_VERSION: &str = "v2.0";

/// W3C trace-context propagated through the handshake and every stamped
/// message so the receiving side can extract a parent span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracingContext {
    pub traceparent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
}

/// A single wire-level message. Bit-exact with the protocol: every field
/// here round-trips through any conforming [`crate::codec::Codec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Short opaque message id, unique per stamped message.
    pub id: String,
    pub from: String,
    pub to: String,
    pub seq: u32,
    pub ack: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    pub control_flags: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<TracingContext>,
    /// Codec-opaque payload. For control messages this is a serialized
    /// [`ControlPayload`]; for everything else it is router-defined.
    pub payload: serde_json::Value,
}

impl TransportMessage {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.control_flags & flag != 0
    }

    pub fn is_ack_only(&self) -> bool {
        self.has_flag(control_flags::ACK) && self.stream_id.as_deref() == Some(HEARTBEAT_STREAM_ID)
    }
}

/// The four control payload kinds carried in [`TransportMessage::payload`].
/// Tagged by a top-level `"type"` string on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlPayload {
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "CLOSE")]
    Close,
    #[serde(rename = "HANDSHAKE_REQ")]
    HandshakeReq {
        #[serde(rename = "protocolVersion")]
        protocol_version: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "expectedSessionState")]
        expected_session_state: ExpectedSessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    #[serde(rename = "HANDSHAKE_RESP")]
    HandshakeResp { status: HandshakeStatus },
}

impl ControlPayload {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("ControlPayload always serializes")
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// `expectedSessionState` carried in a `HANDSHAKE_REQ`.
///
/// `next_sent_seq` is optional on the wire for backwards compatibility with
/// older clients, but new servers MUST require it to adopt an existing
/// session — its absence is treated as a non-matching expected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedSessionState {
    #[serde(rename = "nextExpectedSeq")]
    pub next_expected_seq: u32,
    #[serde(rename = "nextSentSeq", default, skip_serializing_if = "Option::is_none")]
    pub next_sent_seq: Option<u32>,
}

/// `status` field of a `HANDSHAKE_RESP`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandshakeStatus {
    Ok {
        ok: bool,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Err {
        ok: bool,
        reason: String,
        code: HandshakeErrorCode,
    },
}

impl HandshakeStatus {
    pub fn ok(session_id: impl Into<String>) -> Self {
        HandshakeStatus::Ok {
            ok: true,
            session_id: session_id.into(),
        }
    }

    pub fn err(reason: impl Into<String>, code: HandshakeErrorCode) -> Self {
        HandshakeStatus::Err {
            ok: false,
            reason: reason.into(),
            code,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, HandshakeStatus::Ok { .. })
    }
}

/// Handshake error code taxonomy. Partitions into retriable
/// (`SessionStateMismatch`) and fatal (everything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandshakeErrorCode {
    SessionStateMismatch,
    MalformedHandshake,
    MalformedHandshakeMeta,
    ProtocolVersionMismatch,
    RejectedByCustomHandler,
}

impl HandshakeErrorCode {
    /// `true` iff the client should discard its session and retry with a
    /// fresh handshake rather than treating the session as dead.
    pub fn is_retriable(&self) -> bool {
        matches!(self, HandshakeErrorCode::SessionStateMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_only_message_requires_heartbeat_stream_id() {
        let mut msg = sample_message();
        msg.control_flags = control_flags::ACK;
        msg.stream_id = Some(HEARTBEAT_STREAM_ID.to_owned());
        assert!(msg.is_ack_only());

        msg.stream_id = Some("other".to_owned());
        assert!(!msg.is_ack_only());
    }

    #[test]
    fn handshake_req_round_trips_through_json() {
        let payload = ControlPayload::HandshakeReq {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            session_id: "session-abc123def456".to_owned(),
            expected_session_state: ExpectedSessionState {
                next_expected_seq: 4,
                next_sent_seq: Some(7),
            },
            metadata: None,
        };
        let value = payload.to_value();
        assert_eq!(value["type"], "HANDSHAKE_REQ");
        let parsed = ControlPayload::from_value(&value).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn handshake_resp_ok_and_err_round_trip() {
        let ok = ControlPayload::HandshakeResp {
            status: HandshakeStatus::ok("session-1"),
        };
        let v = ok.to_value();
        assert_eq!(v["status"]["ok"], true);
        assert_eq!(ControlPayload::from_value(&v).unwrap(), ok);

        let err = ControlPayload::HandshakeResp {
            status: HandshakeStatus::err("nope", HandshakeErrorCode::ProtocolVersionMismatch),
        };
        let v = err.to_value();
        assert_eq!(v["status"]["code"], "PROTOCOL_VERSION_MISMATCH");
        assert_eq!(ControlPayload::from_value(&v).unwrap(), err);
    }

    #[test]
    fn handshake_error_code_retriable_partition() {
        assert!(HandshakeErrorCode::SessionStateMismatch.is_retriable());
        assert!(!HandshakeErrorCode::MalformedHandshake.is_retriable());
        assert!(!HandshakeErrorCode::MalformedHandshakeMeta.is_retriable());
        assert!(!HandshakeErrorCode::ProtocolVersionMismatch.is_retriable());
        assert!(!HandshakeErrorCode::RejectedByCustomHandler.is_retriable());
    }

    fn sample_message() -> TransportMessage {
        TransportMessage {
            id: "msg-1".to_owned(),
            from: "client".to_owned(),
            to: "SERVER".to_owned(),
            seq: 0,
            ack: 0,
            service_name: None,
            procedure_name: None,
            stream_id: None,
            control_flags: 0,
            tracing: None,
            payload: serde_json::Value::Null,
        }
    }
}
