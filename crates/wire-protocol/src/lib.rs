//! Message model, framing, and codec adapter for the session/transport
//! core. No I/O, no async runtime — this crate is pure data plus
//! encode/decode, consumed by `wire-session`.

pub mod codec;
pub mod framing;
pub mod message;

pub use codec::{Codec, CodecError, JsonCodec};
pub use framing::{encode_frame, Deframer, FramingError};
pub use message::{
    control_flags, ControlPayload, ExpectedSessionState, HandshakeErrorCode, HandshakeStatus,
    TracingContext, TransportMessage, HEARTBEAT_STREAM_ID, PROTOCOL_VERSION,
};
