//! The session itself: fields carried forward on every transition, and the
//! pure bookkeeping operations (sequence/ack accounting, send-buffer
//! pruning) that every state shares. State-specific data and the
//! transition functions between states live in [`state`].

pub mod state;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Span;
use wire_protocol::{control_flags, Codec, ControlPayload, TransportMessage};

use crate::options::SessionOptions;
use crate::telemetry;

pub use state::{SessionState, StateName};

/// Everything a caller supplies for an outbound message; the session
/// stamps `id`/`from`/`to`/`seq`/`ack` on top of this (spec §3, `Session`
/// invariants; spec §4.5 "Send").
#[derive(Debug, Clone)]
pub struct PartialMessage {
    pub control_flags: u8,
    pub stream_id: Option<String>,
    pub service_name: Option<String>,
    pub procedure_name: Option<String>,
    pub payload: serde_json::Value,
}

impl PartialMessage {
    pub fn data(payload: serde_json::Value) -> Self {
        Self {
            control_flags: 0,
            stream_id: None,
            service_name: None,
            procedure_name: None,
            payload,
        }
    }
}

/// Outcome of applying an inbound message's `seq` against the session's
/// local `ack` (spec §4.5, "Message ordering and duplicate handling").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// `seq < ack` — already delivered; drop silently (log at debug).
    Duplicate,
    /// `seq > ack` — a gap. Fatal: abort the session as unhealthy.
    Gap,
    /// `seq == ack` — accepted; `ack` has been advanced to `seq + 1`.
    Accepted,
}

/// Fields carried forward, unchanged in identity, across every transition
/// (spec §4.5: "every transition constructs a fresh session object
/// carrying (id, from, to, seq, ack, sendBuffer, telemetry, options,
/// protocolVersion) forward").
pub struct SessionCore {
    pub id: String,
    pub from: String,
    pub to: String,
    pub seq: u32,
    pub ack: u32,
    pub send_buffer: VecDeque<TransportMessage>,
    pub span: Span,
    pub options: Arc<SessionOptions>,
    pub protocol_version: String,
    /// Bumped by one on every `transition_*`. Background tasks capture the
    /// generation at spawn time and compare against this before acting on
    /// a stale session (the Rust realization of the "consumed handle"
    /// guard described in spec §9 DESIGN NOTES).
    pub generation: u64,
    /// Wall-clock deadline by which the session is destroyed if it has
    /// not reached `Connected`. `None` while `Connected` (cleared on
    /// entry, re-armed with a fresh `session_disconnect_grace` on exit).
    pub grace_expiry: Option<Instant>,
}

impl SessionCore {
    pub fn new(id: String, from: String, to: String, options: Arc<SessionOptions>) -> Self {
        let span = telemetry::session_span(&id, &from, &to);
        Self {
            id,
            from,
            to,
            seq: 0,
            ack: 0,
            send_buffer: VecDeque::new(),
            span,
            options,
            protocol_version: wire_protocol::PROTOCOL_VERSION.to_owned(),
            generation: 0,
            grace_expiry: None,
        }
    }

    /// Stamps a new outbound message: `seq` is the pre-increment value,
    /// then incremented by exactly one (Monotonicity invariant, spec §8).
    pub fn construct_message(
        &mut self,
        control_flags_bits: u8,
        stream_id: Option<String>,
        service_name: Option<String>,
        procedure_name: Option<String>,
        payload: serde_json::Value,
    ) -> TransportMessage {
        let msg = TransportMessage {
            id: new_message_id(),
            from: self.from.clone(),
            to: self.to.clone(),
            seq: self.seq,
            ack: self.ack,
            service_name,
            procedure_name,
            stream_id,
            control_flags: control_flags_bits,
            tracing: telemetry::current_trace_context(),
            payload,
        };
        self.seq += 1;
        msg
    }

    /// Checks the encoded size of the message `partial` *would* produce
    /// before committing to it: stamps a preview with the current
    /// (not-yet-incremented) `seq`/`ack`, encodes it, and only calls
    /// through to [`SessionCore::construct_message`] — which does
    /// increment `seq` — if it fits under `max_payload_size_bytes`. A
    /// rejected message never consumes a sequence number (spec §4.1: the
    /// payload-too-large check happens "locally", before anything is
    /// buffered or sent).
    pub fn construct_checked(
        &mut self,
        partial: PartialMessage,
        codec: &dyn Codec,
        max_payload_size_bytes: usize,
    ) -> Result<TransportMessage, (usize, usize)> {
        let preview = TransportMessage {
            id: new_message_id(),
            from: self.from.clone(),
            to: self.to.clone(),
            seq: self.seq,
            ack: self.ack,
            service_name: partial.service_name.clone(),
            procedure_name: partial.procedure_name.clone(),
            stream_id: partial.stream_id.clone(),
            control_flags: partial.control_flags,
            tracing: telemetry::current_trace_context(),
            payload: partial.payload.clone(),
        };
        let encoded_size = codec
            .to_buffer(&preview)
            .map(|b| b.len())
            .unwrap_or(usize::MAX);
        if encoded_size > max_payload_size_bytes {
            return Err((encoded_size, max_payload_size_bytes));
        }
        Ok(self.construct_message(
            partial.control_flags,
            partial.stream_id,
            partial.service_name,
            partial.procedure_name,
            partial.payload,
        ))
    }

    /// Stamps a handshake request/response at the current seq/ack
    /// snapshot *without* consuming a sequence number. Handshake frames
    /// sit outside the monotonic data stream: the receiver validates them
    /// against the embedded `ExpectedSessionState`/`HandshakeStatus`, not
    /// `record_inbound`, so letting `construct_message` advance `seq` here
    /// would desync it from the peer's `ack` by exactly one on the first
    /// real message of every connection.
    pub fn construct_control(
        &self,
        control_flags_bits: u8,
        stream_id: Option<String>,
        payload: serde_json::Value,
    ) -> TransportMessage {
        TransportMessage {
            id: new_message_id(),
            from: self.from.clone(),
            to: self.to.clone(),
            seq: self.seq,
            ack: self.ack,
            service_name: None,
            procedure_name: None,
            stream_id,
            control_flags: control_flags_bits,
            tracing: telemetry::current_trace_context(),
            payload,
        }
    }

    pub fn construct_ack(&mut self) -> TransportMessage {
        self.construct_message(
            control_flags::ACK,
            Some(wire_protocol::HEARTBEAT_STREAM_ID.to_owned()),
            None,
            None,
            ControlPayload::Ack.to_value(),
        )
    }

    /// Pushes a stamped message onto the send buffer. Every buffered
    /// message has `seq >= firstUnacked.seq` by construction (monotonic
    /// `construct_message` plus FIFO push).
    pub fn buffer(&mut self, msg: TransportMessage) {
        self.send_buffer.push_back(msg);
    }

    /// Drops every buffered message with `seq < ack` (Buffer-ack
    /// invariant, spec §8).
    pub fn apply_ack(&mut self, ack: u32) {
        while let Some(front) = self.send_buffer.front() {
            if front.seq < ack {
                self.send_buffer.pop_front();
            } else {
                break;
            }
        }
    }

    /// Applies an inbound `seq` against local `ack`. On `Accepted`,
    /// advances `ack` to `seq + 1` and prunes the send buffer using the
    /// message's own `ack` field.
    pub fn record_inbound(&mut self, msg: &TransportMessage) -> InboundOutcome {
        if msg.seq < self.ack {
            return InboundOutcome::Duplicate;
        }
        if msg.seq > self.ack {
            return InboundOutcome::Gap;
        }
        self.ack = msg.seq + 1;
        self.apply_ack(msg.ack);
        InboundOutcome::Accepted
    }

    /// Remaining time until `grace_expiry`, or `Duration::ZERO` if it has
    /// already elapsed or was never armed.
    pub fn grace_remaining(&self, now: Instant) -> Duration {
        match self.grace_expiry {
            Some(deadline) if deadline > now => deadline - now,
            _ => Duration::ZERO,
        }
    }

    /// Arms (or re-arms) the grace deadline for `duration` from `now`,
    /// unless one is already running (grace deadlines persist across
    /// states that are all "not Connected" — only entering/leaving
    /// `Connected` resets them).
    pub fn ensure_grace_armed(&mut self, now: Instant, duration: Duration) {
        if self.grace_expiry.is_none() {
            self.grace_expiry = Some(now + duration);
        }
    }

    /// Re-arms the grace deadline with a fresh duration (called on leaving
    /// `Connected`).
    pub fn restart_grace(&mut self, now: Instant, duration: Duration) {
        self.grace_expiry = Some(now + duration);
    }

    /// Clears the grace deadline (called on entering `Connected`).
    pub fn clear_grace(&mut self) {
        self.grace_expiry = None;
    }

    pub fn next_generation(&self) -> u64 {
        self.generation + 1
    }
}

fn new_message_id() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Generates a session id in the suggested `session-<12-char
/// alphanumeric>` format (spec §6).
pub fn new_session_id() -> String {
    format!("session-{}", new_message_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> SessionCore {
        SessionCore::new(
            new_session_id(),
            "client".to_owned(),
            "SERVER".to_owned(),
            Arc::new(SessionOptions::default()),
        )
    }

    #[test]
    fn construct_message_increments_seq_monotonically() {
        let mut c = core();
        let m1 = c.construct_message(0, None, None, None, serde_json::Value::Null);
        let m2 = c.construct_message(0, None, None, None, serde_json::Value::Null);
        assert_eq!(m1.seq, 0);
        assert_eq!(m2.seq, 1);
        assert_eq!(c.seq, 2);
    }

    #[test]
    fn construct_control_does_not_consume_a_sequence_number() {
        let mut c = core();
        let req = c.construct_control(0, None, serde_json::Value::Null);
        assert_eq!(req.seq, 0);
        assert_eq!(c.seq, 0);
        let m1 = c.construct_message(0, None, None, None, serde_json::Value::Null);
        assert_eq!(m1.seq, 0, "first real message must reuse seq 0, not seq 1");
    }

    #[test]
    fn apply_ack_drops_only_messages_below_the_ack() {
        let mut c = core();
        for _ in 0..5 {
            let m = c.construct_message(0, None, None, None, serde_json::Value::Null);
            c.buffer(m);
        }
        c.apply_ack(3);
        assert_eq!(c.send_buffer.len(), 2);
        assert!(c.send_buffer.iter().all(|m| m.seq >= 3));
    }

    #[test]
    fn record_inbound_classifies_duplicate_gap_and_accepted() {
        let mut c = core();
        let mut make = |seq: u32, ack: u32| TransportMessage {
            id: "m".into(),
            from: "SERVER".into(),
            to: "client".into(),
            seq,
            ack,
            service_name: None,
            procedure_name: None,
            stream_id: None,
            control_flags: 0,
            tracing: None,
            payload: serde_json::Value::Null,
        };

        assert_eq!(c.record_inbound(&make(0, 0)), InboundOutcome::Accepted);
        assert_eq!(c.ack, 1);

        assert_eq!(c.record_inbound(&make(0, 0)), InboundOutcome::Duplicate);
        assert_eq!(c.ack, 1, "duplicate must not move ack");

        assert_eq!(c.record_inbound(&make(5, 0)), InboundOutcome::Gap);
        assert_eq!(c.ack, 1, "gap must not move ack");

        assert_eq!(c.record_inbound(&make(1, 0)), InboundOutcome::Accepted);
        assert_eq!(c.ack, 2);
    }

    #[test]
    fn grace_remaining_is_zero_once_elapsed_and_full_duration_when_just_armed() {
        let mut c = core();
        let now = Instant::now();
        c.ensure_grace_armed(now, Duration::from_millis(5000));
        assert_eq!(c.grace_remaining(now), Duration::from_millis(5000));
        assert_eq!(
            c.grace_remaining(now + Duration::from_millis(6000)),
            Duration::ZERO
        );
    }

    #[test]
    fn ensure_grace_armed_does_not_reset_an_already_running_deadline() {
        let mut c = core();
        let now = Instant::now();
        c.ensure_grace_armed(now, Duration::from_millis(5000));
        // Simulate time passing, then another state entry tries to re-arm.
        let later = now + Duration::from_millis(2000);
        c.ensure_grace_armed(later, Duration::from_millis(5000));
        // Remaining should reflect the *original* deadline, not a fresh one.
        assert_eq!(c.grace_remaining(later), Duration::from_millis(3000));
    }
}
