//! Length-prefixed framing over a raw byte-duplex: `u32_be length ||
//! payload_bytes`. The session layer never sees partial frames — a
//! [`Deframer`] buffers across chunks and yields one complete frame at a
//! time.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Default cap on a single frame's payload (spec default: 4 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE_BYTES: usize = 4 * 1024 * 1024;

/// Default cap on the deframer's internal buffer before a peer is
/// considered to be misbehaving.
pub const DEFAULT_MAX_BUFFER_SIZE_BYTES: usize = 8 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum FramingError {
    #[error("payload exceeded maximum payload size size={size} max={max}")]
    MaxPayloadSizeExceeded { size: usize, max: usize },
    #[error("deframing buffer exceeded max buffer size ({max} bytes)")]
    BufferOverflow { max: usize },
}

/// Encode a single payload as one length-prefixed frame.
pub fn encode_frame(payload: &[u8], max_payload_size_bytes: usize) -> Result<Bytes, FramingError> {
    if payload.len() > max_payload_size_bytes {
        return Err(FramingError::MaxPayloadSizeExceeded {
            size: payload.len(),
            max: max_payload_size_bytes,
        });
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Incremental frame parser. Feed it bytes as they arrive from the
/// underlying connection; pull complete frames out with [`Deframer::next_frame`].
pub struct Deframer {
    buf: BytesMut,
    max_payload_size_bytes: usize,
    max_buffer_size_bytes: usize,
}

impl Deframer {
    pub fn new(max_payload_size_bytes: usize, max_buffer_size_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload_size_bytes,
            max_buffer_size_bytes,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_MAX_PAYLOAD_SIZE_BYTES,
            DEFAULT_MAX_BUFFER_SIZE_BYTES,
        )
    }

    /// Append newly-received bytes. Returns `BufferOverflow` if doing so
    /// would exceed `max_buffer_size_bytes`; the caller MUST treat this as
    /// a hard framing error and close the connection.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        if self.buf.len() + bytes.len() > self.max_buffer_size_bytes {
            return Err(FramingError::BufferOverflow {
                max: self.max_buffer_size_bytes,
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Pop one complete frame, if buffered. Returns `Ok(None)` when more
    /// bytes are needed. A single call only ever returns at most one
    /// frame — call in a loop to drain everything currently buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FramingError> {
        if self.buf.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let len = u32::from_be_bytes(self.buf[..LENGTH_PREFIX_BYTES].try_into().unwrap()) as usize;
        if len > self.max_payload_size_bytes {
            return Err(FramingError::MaxPayloadSizeExceeded {
                size: len,
                max: self.max_payload_size_bytes,
            });
        }
        if self.buf.len() < LENGTH_PREFIX_BYTES + len {
            return Ok(None);
        }
        self.buf.advance(LENGTH_PREFIX_BYTES);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_deframe_round_trips_a_single_frame() {
        let frame = encode_frame(b"hello", DEFAULT_MAX_PAYLOAD_SIZE_BYTES).unwrap();
        let mut deframer = Deframer::with_defaults();
        deframer.push(&frame).unwrap();
        assert_eq!(deframer.next_frame().unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(deframer.next_frame().unwrap(), None);
    }

    #[test]
    fn deframer_buffers_partial_frame_across_chunks() {
        let frame = encode_frame(b"partial-payload", DEFAULT_MAX_PAYLOAD_SIZE_BYTES).unwrap();
        let mut deframer = Deframer::with_defaults();
        deframer.push(&frame[..3]).unwrap();
        assert_eq!(deframer.next_frame().unwrap(), None);
        deframer.push(&frame[3..]).unwrap();
        assert_eq!(
            deframer.next_frame().unwrap().unwrap(),
            Bytes::from_static(b"partial-payload")
        );
    }

    #[test]
    fn deframer_yields_multiple_queued_frames_one_at_a_time() {
        let mut deframer = Deframer::with_defaults();
        let f1 = encode_frame(b"one", DEFAULT_MAX_PAYLOAD_SIZE_BYTES).unwrap();
        let f2 = encode_frame(b"two", DEFAULT_MAX_PAYLOAD_SIZE_BYTES).unwrap();
        deframer.push(&f1).unwrap();
        deframer.push(&f2).unwrap();
        assert_eq!(deframer.next_frame().unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(deframer.next_frame().unwrap().unwrap(), Bytes::from_static(b"two"));
        assert_eq!(deframer.next_frame().unwrap(), None);
    }

    #[test]
    fn encode_frame_rejects_oversized_payload() {
        let err = encode_frame(&[0u8; 10], 4).unwrap_err();
        assert_eq!(err, FramingError::MaxPayloadSizeExceeded { size: 10, max: 4 });
    }

    #[test]
    fn next_frame_rejects_oversized_length_prefix_before_buffering_body() {
        let mut deframer = Deframer::new(4, DEFAULT_MAX_BUFFER_SIZE_BYTES);
        deframer.push(&10u32.to_be_bytes()).unwrap();
        let err = deframer.next_frame().unwrap_err();
        assert_eq!(err, FramingError::MaxPayloadSizeExceeded { size: 10, max: 4 });
    }

    #[test]
    fn push_rejects_growth_past_max_buffer_size() {
        let mut deframer = Deframer::new(DEFAULT_MAX_PAYLOAD_SIZE_BYTES, 4);
        let err = deframer.push(&[0u8; 5]).unwrap_err();
        assert_eq!(err, FramingError::BufferOverflow { max: 4 });
    }
}
