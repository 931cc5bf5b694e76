//! Session and transport core of a transport-agnostic RPC framework: the
//! six-state session FSM, the binary handshake protocol, sequence/ack
//! bookkeeping with replay-on-reconnect, heartbeats, connection retry with
//! a leaky-bucket budget, grace-period accounting, and the event surface a
//! higher-level RPC router multiplexes on top of.
//!
//! This crate has no opinion on what bytes flow over the wire beyond
//! [`wire_protocol::TransportMessage`] — the concrete byte-duplex
//! ([`Connection`]) and the clock ([`Clock`]) are supplied by the
//! embedder. See `wire-test-support` for an in-memory pair of both, used
//! by this crate's own integration tests.

pub mod clock;
pub mod connection;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod options;
pub mod retry;
pub mod session;
pub mod telemetry;

pub mod client;
pub mod server;

pub use clock::{Clock, RealClock};
pub use client::{ClientHandshakeOptions, ClientTransport};
pub use connection::{ClientConnector, Connection, ConnectionEvent};
pub use error::{HandshakeFailure, MaxPayloadSizeExceeded, ProtocolError, SendError, Side};
pub use events::{
    Event, EventDispatcher, ListenerId, SessionStateName, SessionStatusEvent, SessionStatusKind,
    SessionTransitionEvent, TransportStatusKind,
};
pub use options::{SessionOptions, SessionOptionsBuilder};
pub use retry::RetryBudget;
pub use server::{AcceptAllValidator, HandshakeValidator, ServerHandshakeOptions, ServerTransport};
pub use session::{PartialMessage, SessionCore, SessionState, StateName};
