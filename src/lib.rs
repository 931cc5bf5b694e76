//! `river-core`: the session and transport core of a transport-agnostic
//! RPC framework, split the way the workspace splits it —
//! [`wire_protocol`] (message model, framing, codec trait) underneath
//! [`wire_session`] (the state machine, client/server transports, retry
//! budget, heartbeats, event dispatcher).
//!
//! This crate is a thin umbrella: application code typically depends on
//! `wire-session` directly and reaches `wire-protocol` through it. This
//! re-export exists so embedders that only want one `Cargo.toml` line can
//! pull in both at matching versions.

pub use wire_protocol;
pub use wire_session;
