//! The six-state FSM (spec §4.5). Every `transition_*` function consumes
//! the old variant's data by value, cancels whatever timers/tasks it
//! owned, and returns a fresh variant carrying the [`SessionCore`] forward
//! with its `generation` bumped. There is no way to reach into an old
//! variant after a transition — Rust's move semantics are the "consumed
//! handle" trap described in spec §9, enforced at compile time rather than
//! by a runtime proxy.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::heartbeat::HeartbeatMonitor;

use super::SessionCore;

/// The FSM's state names, independent of payload — used in
/// `sessionTransition` events and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateName {
    NoConnection,
    BackingOff,
    Connecting,
    Handshaking,
    Connected,
    WaitingForHandshake,
}

impl std::fmt::Display for StateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StateName::NoConnection => "no_connection",
            StateName::BackingOff => "backing_off",
            StateName::Connecting => "connecting",
            StateName::Handshaking => "handshaking",
            StateName::Connected => "connected",
            StateName::WaitingForHandshake => "waiting_for_handshake",
        };
        f.write_str(s)
    }
}

/// No active connection and nothing in flight. The session's grace timer
/// (if armed) keeps ticking while in this state.
pub struct NoConnectionData {
    pub core: SessionCore,
}

/// Waiting out a computed backoff before the next connection attempt.
pub struct BackingOffData {
    pub core: SessionCore,
    pub backoff: Duration,
    pub timer: JoinHandle<()>,
}

/// A connection attempt is in flight. Owns the pending-connection task and
/// an overall `connectionTimeoutMs` timer; both are cancelled on exit.
pub struct ConnectingData {
    pub core: SessionCore,
    pub connect_task: JoinHandle<()>,
    pub timeout_timer: JoinHandle<()>,
}

/// Connection established; `HANDSHAKE_REQ` has been sent and we are
/// waiting for `HANDSHAKE_RESP`. Owns the connection and a
/// `handshakeTimeoutMs` timer.
pub struct HandshakingData {
    pub core: SessionCore,
    pub connection: Arc<dyn Connection>,
    pub timeout_timer: JoinHandle<()>,
}

/// Fully connected and identified. Owns the connection and the active
/// heartbeat monitor.
pub struct ConnectedData {
    pub core: SessionCore,
    pub connection: Arc<dyn Connection>,
    pub heartbeat: HeartbeatMonitor,
}

/// Server-side only: a connection has arrived but has not yet presented a
/// valid `HANDSHAKE_REQ`. Owns the connection and a `handshakeTimeoutMs`
/// timer; never becomes identified until the handshake succeeds.
pub struct WaitingForHandshakeData {
    pub core: SessionCore,
    pub connection: Arc<dyn Connection>,
    pub timeout_timer: JoinHandle<()>,
}

pub enum SessionState {
    NoConnection(NoConnectionData),
    BackingOff(BackingOffData),
    Connecting(ConnectingData),
    Handshaking(HandshakingData),
    Connected(ConnectedData),
    WaitingForHandshake(WaitingForHandshakeData),
}

impl SessionState {
    pub fn name(&self) -> StateName {
        match self {
            SessionState::NoConnection(_) => StateName::NoConnection,
            SessionState::BackingOff(_) => StateName::BackingOff,
            SessionState::Connecting(_) => StateName::Connecting,
            SessionState::Handshaking(_) => StateName::Handshaking,
            SessionState::Connected(_) => StateName::Connected,
            SessionState::WaitingForHandshake(_) => StateName::WaitingForHandshake,
        }
    }

    pub fn core(&self) -> &SessionCore {
        match self {
            SessionState::NoConnection(d) => &d.core,
            SessionState::BackingOff(d) => &d.core,
            SessionState::Connecting(d) => &d.core,
            SessionState::Handshaking(d) => &d.core,
            SessionState::Connected(d) => &d.core,
            SessionState::WaitingForHandshake(d) => &d.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut SessionCore {
        match self {
            SessionState::NoConnection(d) => &mut d.core,
            SessionState::BackingOff(d) => &mut d.core,
            SessionState::Connecting(d) => &mut d.core,
            SessionState::Handshaking(d) => &mut d.core,
            SessionState::Connected(d) => &mut d.core,
            SessionState::WaitingForHandshake(d) => &mut d.core,
        }
    }

    pub fn generation(&self) -> u64 {
        self.core().generation
    }

    /// Cancels every timer/task this variant owns. Called on every
    /// transition and on session deletion (spec §8, Timer cleanup
    /// invariant) before the data is dropped.
    pub fn cancel_timers(&self) {
        match self {
            SessionState::NoConnection(_) => {}
            SessionState::BackingOff(d) => d.timer.abort(),
            SessionState::Connecting(d) => {
                d.connect_task.abort();
                d.timeout_timer.abort();
            }
            SessionState::Handshaking(d) => d.timeout_timer.abort(),
            SessionState::Connected(_) => {}
            SessionState::WaitingForHandshake(d) => d.timeout_timer.abort(),
        }
    }

    /// Removes this variant's installed connection listener, if any
    /// (spec §8, Connection ownership invariant: at most one installed
    /// listener at any instant). The connection itself may still be
    /// closed by the caller separately.
    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        match self {
            SessionState::Handshaking(d) => Some(&d.connection),
            SessionState::Connected(d) => Some(&d.connection),
            SessionState::WaitingForHandshake(d) => Some(&d.connection),
            _ => None,
        }
    }
}

fn bump_generation(mut core: SessionCore) -> SessionCore {
    core.generation = core.next_generation();
    core
}

/// `NoConnection -> BackingOff` (client transition 1).
pub fn transition_to_backing_off(
    old: NoConnectionData,
    backoff: Duration,
    timer: JoinHandle<()>,
) -> BackingOffData {
    old.core.span.in_scope(|| {
        tracing::debug!(state = %StateName::BackingOff, backoff_ms = backoff.as_millis() as u64, "session transition")
    });
    BackingOffData {
        core: bump_generation(old.core),
        backoff,
        timer,
    }
}

/// `BackingOff -> Connecting` (client transition 2).
pub fn transition_to_connecting(
    old: BackingOffData,
    connect_task: JoinHandle<()>,
    timeout_timer: JoinHandle<()>,
) -> ConnectingData {
    old.timer.abort();
    old.core
        .span
        .in_scope(|| tracing::debug!(state = %StateName::Connecting, "session transition"));
    ConnectingData {
        core: bump_generation(old.core),
        connect_task,
        timeout_timer,
    }
}

/// `Connecting -> Handshaking` (client transition 3).
pub fn transition_to_handshaking(
    old: ConnectingData,
    connection: Arc<dyn Connection>,
    timeout_timer: JoinHandle<()>,
) -> HandshakingData {
    old.connect_task.abort();
    old.timeout_timer.abort();
    old.core
        .span
        .in_scope(|| tracing::debug!(state = %StateName::Handshaking, "session transition"));
    HandshakingData {
        core: bump_generation(old.core),
        connection,
        timeout_timer,
    }
}

/// `Handshaking -> Connected` (client transition 4), also used
/// server-side for `WaitingForHandshake -> Connected`.
pub fn transition_to_connected(
    mut core: SessionCore,
    connection: Arc<dyn Connection>,
    heartbeats_until_dead: u32,
) -> ConnectedData {
    core.clear_grace();
    core = bump_generation(core);
    core.span
        .in_scope(|| tracing::info!(state = %StateName::Connected, "session transition"));
    ConnectedData {
        core,
        connection,
        heartbeat: HeartbeatMonitor::new(heartbeats_until_dead),
    }
}

/// Any of `Connecting | Handshaking | Connected -> NoConnection` (client
/// transition 5). Re-arms the grace deadline with a fresh duration when
/// leaving `Connected`; otherwise the deadline (already running) carries
/// over unchanged — callers pass `was_connected` to select which.
pub fn transition_to_no_connection(
    mut core: SessionCore,
    was_connected: bool,
    grace_duration: Duration,
    now: std::time::Instant,
) -> NoConnectionData {
    if was_connected {
        core.restart_grace(now, grace_duration);
    } else {
        core.ensure_grace_armed(now, grace_duration);
    }
    core = bump_generation(core);
    core.span
        .in_scope(|| tracing::debug!(state = %StateName::NoConnection, "session transition"));
    NoConnectionData { core }
}

/// `BackingOff -> NoConnection` (client transition 6, cancel on transport
/// close). Grace bookkeeping is irrelevant here — the caller deletes the
/// session immediately afterward.
pub fn cancel_backing_off(old: BackingOffData) -> NoConnectionData {
    old.timer.abort();
    NoConnectionData {
        core: bump_generation(old.core),
    }
}

/// `WaitingForHandshake` constructor (server transition starting point):
/// a connection arrived and has not yet presented a handshake.
pub fn new_waiting_for_handshake(
    core: SessionCore,
    connection: Arc<dyn Connection>,
    timeout_timer: JoinHandle<()>,
) -> WaitingForHandshakeData {
    WaitingForHandshakeData {
        core,
        connection,
        timeout_timer,
    }
}
