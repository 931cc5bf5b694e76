//! `SessionOptions`: every tunable named in the spec, with the spec's
//! defaults, plus a small builder in the shape of the reference stack's
//! own layered config types.

use std::sync::Arc;
use std::time::Duration;

use wire_protocol::{Codec, JsonCodec};

/// All session/transport tunables. `all integers are milliseconds unless
/// noted`, matching the spec's configuration table verbatim.
#[derive(Clone)]
pub struct SessionOptions {
    /// Active heartbeat period.
    pub heartbeat_interval: Duration,
    /// Misses before closing the connection (not the session).
    pub heartbeats_until_dead: u32,
    /// Time without a `Connected` state before destroying the session.
    pub session_disconnect_grace: Duration,
    /// Max time in `Connecting`.
    pub connection_timeout: Duration,
    /// Max time in `Handshaking` / `WaitingForHandshake`.
    pub handshake_timeout: Duration,
    /// If false, every reconnect starts a fresh session (`seq=ack=0`).
    pub enable_transparent_session_reconnects: bool,
    pub max_payload_size_bytes: usize,
    pub max_buffer_size_bytes: usize,
    pub codec: Arc<dyn Codec>,

    // Client-only retry budget parameters (spec §4.4).
    pub base_interval: Duration,
    pub max_jitter: Duration,
    pub max_backoff: Duration,
    pub attempt_budget_capacity: u32,
    pub budget_restore_interval: Duration,

    /// If false, the client transport never attempts to reconnect after a
    /// connection drop (the session is left to expire its grace period).
    pub reconnect_on_connection_drop: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            heartbeats_until_dead: 2,
            session_disconnect_grace: Duration::from_millis(5000),
            connection_timeout: Duration::from_millis(2000),
            handshake_timeout: Duration::from_millis(1000),
            enable_transparent_session_reconnects: true,
            max_payload_size_bytes: wire_protocol::framing::DEFAULT_MAX_PAYLOAD_SIZE_BYTES,
            max_buffer_size_bytes: wire_protocol::framing::DEFAULT_MAX_BUFFER_SIZE_BYTES,
            codec: Arc::new(JsonCodec),
            base_interval: Duration::from_millis(150),
            max_jitter: Duration::from_millis(200),
            max_backoff: Duration::from_millis(32_000),
            attempt_budget_capacity: 5,
            budget_restore_interval: Duration::from_millis(200),
            reconnect_on_connection_drop: true,
        }
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeats_until_dead", &self.heartbeats_until_dead)
            .field("session_disconnect_grace", &self.session_disconnect_grace)
            .field("connection_timeout", &self.connection_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field(
                "enable_transparent_session_reconnects",
                &self.enable_transparent_session_reconnects,
            )
            .field("max_payload_size_bytes", &self.max_payload_size_bytes)
            .field("max_buffer_size_bytes", &self.max_buffer_size_bytes)
            .field("base_interval", &self.base_interval)
            .field("max_jitter", &self.max_jitter)
            .field("max_backoff", &self.max_backoff)
            .field("attempt_budget_capacity", &self.attempt_budget_capacity)
            .field("budget_restore_interval", &self.budget_restore_interval)
            .field(
                "reconnect_on_connection_drop",
                &self.reconnect_on_connection_drop,
            )
            .finish()
    }
}

impl SessionOptions {
    pub fn builder() -> SessionOptionsBuilder {
        SessionOptionsBuilder {
            options: SessionOptions::default(),
        }
    }
}

/// Builder for overriding individual [`SessionOptions`] fields without
/// restating every default.
pub struct SessionOptionsBuilder {
    options: SessionOptions,
}

macro_rules! builder_field {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.options.$name = value;
            self
        }
    };
}

impl SessionOptionsBuilder {
    builder_field!(heartbeat_interval, Duration);
    builder_field!(heartbeats_until_dead, u32);
    builder_field!(session_disconnect_grace, Duration);
    builder_field!(connection_timeout, Duration);
    builder_field!(handshake_timeout, Duration);
    builder_field!(enable_transparent_session_reconnects, bool);
    builder_field!(max_payload_size_bytes, usize);
    builder_field!(max_buffer_size_bytes, usize);
    builder_field!(base_interval, Duration);
    builder_field!(max_jitter, Duration);
    builder_field!(max_backoff, Duration);
    builder_field!(attempt_budget_capacity, u32);
    builder_field!(budget_restore_interval, Duration);
    builder_field!(reconnect_on_connection_drop, bool);

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.options.codec = codec;
        self
    }

    pub fn build(self) -> SessionOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let opts = SessionOptions::default();
        assert_eq!(opts.heartbeat_interval, Duration::from_millis(1000));
        assert_eq!(opts.heartbeats_until_dead, 2);
        assert_eq!(opts.session_disconnect_grace, Duration::from_millis(5000));
        assert_eq!(opts.connection_timeout, Duration::from_millis(2000));
        assert_eq!(opts.handshake_timeout, Duration::from_millis(1000));
        assert!(opts.enable_transparent_session_reconnects);
        assert_eq!(opts.max_payload_size_bytes, 4 * 1024 * 1024);
        assert_eq!(opts.base_interval, Duration::from_millis(150));
        assert_eq!(opts.max_jitter, Duration::from_millis(200));
        assert_eq!(opts.max_backoff, Duration::from_millis(32_000));
        assert_eq!(opts.attempt_budget_capacity, 5);
        assert_eq!(opts.budget_restore_interval, Duration::from_millis(200));
    }

    #[test]
    fn builder_overrides_only_requested_fields() {
        let opts = SessionOptions::builder()
            .max_payload_size_bytes(1024)
            .heartbeats_until_dead(5)
            .build();
        assert_eq!(opts.max_payload_size_bytes, 1024);
        assert_eq!(opts.heartbeats_until_dead, 5);
        assert_eq!(opts.heartbeat_interval, Duration::from_millis(1000));
    }
}
