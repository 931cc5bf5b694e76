//! Codec adapter: encode/decode opaque messages. Never panics or throws —
//! every failure is a typed [`CodecError`], matching `serialize_error` /
//! `deserialize_error` in the spec's error taxonomy.

use crate::message::TransportMessage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialize_error: {0}")]
    Serialize(String),
    #[error("deserialize_error: {0}")]
    Deserialize(String),
}

/// Bytes-to-message adapter. Implementations MUST NOT panic; every failure
/// is surfaced as a [`CodecError`].
pub trait Codec: Send + Sync {
    fn to_buffer(&self, msg: &TransportMessage) -> Result<Vec<u8>, CodecError>;
    fn from_buffer(&self, bytes: &[u8]) -> Result<TransportMessage, CodecError>;
}

/// Default codec: length-delimited JSON. A binary (msgpack-equivalent)
/// codec is interchangeable as long as it round-trips unknown payloads and
/// omits `undefined`/absent fields the way this one does via `serde`'s
/// `skip_serializing_if`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn to_buffer(&self, msg: &TransportMessage) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn from_buffer(&self, bytes: &[u8]) -> Result<TransportMessage, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{control_flags, HEARTBEAT_STREAM_ID};

    fn ack_message() -> TransportMessage {
        TransportMessage {
            id: "msg-1".to_owned(),
            from: "client".to_owned(),
            to: "SERVER".to_owned(),
            seq: 3,
            ack: 4,
            service_name: None,
            procedure_name: None,
            stream_id: Some(HEARTBEAT_STREAM_ID.to_owned()),
            control_flags: control_flags::ACK,
            tracing: None,
            payload: serde_json::json!({"type": "ACK"}),
        }
    }

    #[test]
    fn json_codec_round_trips_a_message() {
        let codec = JsonCodec;
        let msg = ack_message();
        let bytes = codec.to_buffer(&msg).unwrap();
        let decoded = codec.from_buffer(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn json_codec_from_buffer_reports_deserialize_error_on_garbage() {
        let codec = JsonCodec;
        let err = codec.from_buffer(b"not json").unwrap_err();
        assert!(matches!(err, CodecError::Deserialize(_)));
    }

    #[test]
    fn json_codec_from_buffer_reports_deserialize_error_on_schema_mismatch() {
        let codec = JsonCodec;
        let err = codec.from_buffer(b"{\"unrelated\":true}").unwrap_err();
        assert!(matches!(err, CodecError::Deserialize(_)));
    }
}
