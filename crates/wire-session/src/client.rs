//! Client transport (spec §4.6): owns every session this process has
//! opened toward a remote peer, drives reconnect, and speaks the
//! handshake-request side of the protocol.
//!
//! The session map lives behind a single `tokio::sync::Mutex` — there is
//! no internal thread pool; every reaction (timer fired, connection
//! established, frame arrived) takes the lock, re-reads the live state for
//! its peer, checks its captured `generation` still matches, and either
//! acts or no-ops (spec §9's "consumed handle" trap, realized without a
//! runtime proxy).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use wire_protocol::{
    control_flags, encode_frame, Codec, ControlPayload, Deframer, ExpectedSessionState,
    HandshakeStatus, TransportMessage, PROTOCOL_VERSION,
};

use crate::clock::Clock;
use crate::connection::{ClientConnector, Connection, ConnectionEvent};
use crate::error::{MaxPayloadSizeExceeded, ProtocolError, SendError, Side};
use crate::events::{
    Event, EventDispatcher, SessionStatusEvent, SessionStatusKind, SessionTransitionEvent,
    TransportStatusKind,
};
use crate::options::SessionOptions;
use crate::retry::RetryBudget;
use crate::session::state::{
    cancel_backing_off, new_waiting_for_handshake, transition_to_backing_off,
    transition_to_connected, transition_to_connecting, transition_to_handshaking,
    transition_to_no_connection, BackingOffData, ConnectedData, ConnectingData, HandshakingData,
    NoConnectionData,
};
use crate::session::{new_session_id, PartialMessage, SessionCore, SessionState, StateName};

/// Metadata blob and validation hook for extending the handshake (spec
/// §1: "the handshake is extensible with a validated metadata blob").
#[derive(Clone, Default)]
pub struct ClientHandshakeOptions {
    pub metadata: Option<serde_json::Value>,
}

/// The client-side session/transport core. Cheap to clone — it is a
/// handle around a shared `Arc<ClientInner>`.
#[derive(Clone)]
pub struct ClientTransport {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    client_id: String,
    options: Arc<SessionOptions>,
    clock: Arc<dyn Clock>,
    connector: Arc<dyn ClientConnector>,
    events: Arc<EventDispatcher>,
    handshake: ClientHandshakeOptions,
    sessions: Mutex<HashMap<String, SessionState>>,
    retry_budgets: Mutex<HashMap<String, Arc<RetryBudget>>>,
    closed: AtomicBool,
}

impl ClientTransport {
    pub fn new(
        client_id: impl Into<String>,
        options: Arc<SessionOptions>,
        clock: Arc<dyn Clock>,
        connector: Arc<dyn ClientConnector>,
        events: Arc<EventDispatcher>,
        handshake: ClientHandshakeOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                client_id: client_id.into(),
                options,
                clock,
                connector,
                events,
                handshake,
                sessions: Mutex::new(HashMap::new()),
                retry_budgets: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.inner.events
    }

    /// `connect(to)` (spec §4.6). No-op if the transport is closed, or if
    /// a session for `to` already exists and is not `NoConnection`.
    pub async fn connect(&self, to: &str) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut sessions = self.inner.sessions.lock().await;
        let needs_create = !sessions.contains_key(to);
        if needs_create {
            let core = SessionCore::new(new_session_id(), self.inner.client_id.clone(), to.to_owned(), Arc::clone(&self.inner.options));
            self.inner.events.dispatch(Event::SessionStatus(SessionStatusEvent {
                status: SessionStatusKind::Created,
                session_id: core.id.clone(),
                peer: to.to_owned(),
            }));
            sessions.insert(to.to_owned(), SessionState::NoConnection(NoConnectionData { core }));
        }

        let is_no_connection = matches!(sessions.get(to), Some(SessionState::NoConnection(_)));
        if !is_no_connection {
            return;
        }

        drop(sessions);
        let budget = self.inner.retry_budget_for(to).await;
        if !budget.has_budget() {
            self.inner.events.dispatch(Event::ProtocolError(
                ProtocolError::RetriesExceeded(to.to_owned()),
            ));
            return;
        }
        let mut sessions = self.inner.sessions.lock().await;
        // Re-check: another caller may have raced us between the drop above
        // and re-acquiring the lock.
        if !matches!(sessions.get(to), Some(SessionState::NoConnection(_))) {
            return;
        }

        budget.consume_budget();
        let backoff = budget.get_backoff();
        let old = match sessions.remove(to) {
            Some(SessionState::NoConnection(d)) => d,
            _ => unreachable!(),
        };
        let id = old.core.id.clone();
        let timer = self.inner.spawn_backoff_timer(to.to_owned(), old.core.next_generation(), backoff);
        let new_state = transition_to_backing_off(old, backoff, timer);
        self.inner.emit_transition(StateName::BackingOff, &id);
        sessions.insert(to.to_owned(), SessionState::BackingOff(new_state));
    }

    /// `send(to, partialMsg)` (spec §4.6). Creates a session (and kicks
    /// off `connect`) if absent.
    pub async fn send(&self, to: &str, partial: PartialMessage) -> Result<(), SendError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SendError::TransportClosed);
        }
        {
            let sessions = self.inner.sessions.lock().await;
            if !sessions.contains_key(to) {
                drop(sessions);
                self.connect(to).await;
            }
        }

        let mut sessions = self.inner.sessions.lock().await;
        let Some(state) = sessions.get_mut(to) else {
            return Err(SendError::TransportClosed);
        };

        match state {
            SessionState::Connected(data) => {
                let stamped = match data.core.construct_checked(
                    partial,
                    data.core.options.codec.as_ref(),
                    data.core.options.max_payload_size_bytes,
                ) {
                    Ok(m) => m,
                    Err((size, max)) => {
                        return Err(SendError::PayloadTooLarge(MaxPayloadSizeExceeded {
                            side: Side::Client,
                            size,
                            max,
                        }))
                    }
                };
                data.core.buffer(stamped.clone());
                let encoded = data.core.options.codec.to_buffer(&stamped);
                let max_payload_size_bytes = data.core.options.max_payload_size_bytes;
                let ok = match encoded {
                    Ok(bytes) => send_framed(&data.connection, bytes, max_payload_size_bytes).await,
                    Err(_) => false,
                };
                if !ok {
                    let peer = to.to_owned();
                    drop(sessions);
                    self.inner
                        .delete_session_unhealthy(
                            &peer,
                            ProtocolError::MessageSendFailure(
                                "connection send failed or encoding error".to_owned(),
                            ),
                        )
                        .await;
                }
                Ok(())
            }
            _ => {
                let core = state.core_mut();
                let stamped = core
                    .construct_checked(partial, core.options.codec.as_ref(), core.options.max_payload_size_bytes)
                    .map_err(|(size, max)| {
                        SendError::PayloadTooLarge(MaxPayloadSizeExceeded {
                            side: Side::Client,
                            size,
                            max,
                        })
                    })?;
                core.buffer(stamped);
                Ok(())
            }
        }
    }

    /// Deletes every session immediately, without waiting for a grace
    /// period (spec §4.6).
    pub async fn hard_disconnect(&self) {
        let mut sessions = self.inner.sessions.lock().await;
        for (peer, state) in sessions.drain() {
            send_close_courtesy(&state).await;
            state.cancel_timers();
            if let Some(conn) = state.connection() {
                conn.close();
            }
            self.inner.events.dispatch(Event::SessionStatus(SessionStatusEvent {
                status: SessionStatusKind::Closed,
                session_id: state.core().id.clone(),
                peer,
            }));
        }
    }

    /// Stops the retry budgets, closes every session, marks the transport
    /// closed (spec §4.6, §5 Cancellation).
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        for budget in self.inner.retry_budgets.lock().await.values() {
            budget.close();
        }
        self.hard_disconnect().await;
        self.inner
            .events
            .dispatch(Event::TransportStatus(TransportStatusKind::Closed));
    }
}

impl ClientInner {
    async fn retry_budget_for(&self, peer: &str) -> Arc<RetryBudget> {
        let mut budgets = self.retry_budgets.lock().await;
        budgets
            .entry(peer.to_owned())
            .or_insert_with(|| {
                RetryBudget::new(
                    self.options.attempt_budget_capacity,
                    self.options.base_interval,
                    self.options.max_jitter,
                    self.options.max_backoff,
                    self.options.budget_restore_interval,
                    Arc::clone(&self.clock),
                )
            })
            .clone()
    }

    fn emit_transition(&self, state: StateName, id: &str) {
        self.events.dispatch(Event::SessionTransition(SessionTransitionEvent {
            state: state.into(),
            id: id.to_owned(),
        }));
    }

    /// Removes a session from the map, cancelling its timers and
    /// connection, and emits `protocolError` then `sessionStatus{closed}`
    /// (spec §7 error table: every "delete session unhealthy" action).
    async fn delete_session_unhealthy(self: &Arc<Self>, peer: &str, reason: ProtocolError) {
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.remove(peer) {
            state.cancel_timers();
            if let Some(conn) = state.connection() {
                conn.close();
            }
            let session_id = state.core().id.clone();
            drop(sessions);
            self.events.dispatch(Event::ProtocolError(reason));
            self.events.dispatch(Event::SessionStatus(SessionStatusEvent {
                status: SessionStatusKind::Closed,
                session_id,
                peer: peer.to_owned(),
            }));
        }
    }

    /// Removes a session without treating it as an error (grace elapsed,
    /// fatal handshake rejection already reported separately, etc).
    async fn delete_session_quiet(self: &Arc<Self>, peer: &str) {
        self.delete_session_quiet_inner(peer, true).await;
    }

    /// As [`ClientInner::delete_session_quiet`], but never sends a `CLOSE`
    /// courtesy message first — used when the session is being torn down
    /// *because* the peer already sent us one.
    async fn delete_session_after_peer_close(self: &Arc<Self>, peer: &str) {
        self.delete_session_quiet_inner(peer, false).await;
    }

    async fn delete_session_quiet_inner(self: &Arc<Self>, peer: &str, send_courtesy: bool) {
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.remove(peer) {
            if send_courtesy {
                send_close_courtesy(&state).await;
            }
            state.cancel_timers();
            if let Some(conn) = state.connection() {
                conn.close();
            }
            let session_id = state.core().id.clone();
            drop(sessions);
            self.events.dispatch(Event::SessionStatus(SessionStatusEvent {
                status: SessionStatusKind::Closed,
                session_id,
                peer: peer.to_owned(),
            }));
        }
    }

    fn spawn_backoff_timer(
        self: &Arc<Self>,
        peer: String,
        generation: u64,
        backoff: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let clock = Arc::clone(&self.clock);
        tokio::spawn(async move {
            clock.sleep(backoff).await;
            this.on_backoff_finished(peer, generation).await;
        })
    }

    async fn on_backoff_finished(self: &Arc<Self>, peer: String, generation: u64) {
        let mut sessions = self.sessions.lock().await;
        let Some(state) = sessions.get(&peer) else { return; };
        if state.generation() != generation || !matches!(state, SessionState::BackingOff(_)) {
            return;
        }
        let old = match sessions.remove(&peer) {
            Some(SessionState::BackingOff(d)) => d,
            _ => unreachable!(),
        };
        let id = old.core.id.clone();
        let new_generation = old.core.next_generation();
        let connect_task = self.spawn_connect_task(peer.clone(), new_generation);
        let timeout_timer = self.spawn_connection_timeout_timer(peer.clone(), new_generation);
        let new_state = transition_to_connecting(old, connect_task, timeout_timer);
        sessions.insert(peer.clone(), SessionState::Connecting(new_state));
        drop(sessions);
        self.emit_transition(StateName::Connecting, &id);
    }

    fn spawn_connect_task(
        self: &Arc<Self>,
        peer: String,
        generation: u64,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.connector.connect(&peer).await {
                Ok(conn) => this.on_connection_established(peer, generation, conn).await,
                Err(reason) => this.on_connecting_failed(peer, generation, reason).await,
            }
        })
    }

    fn spawn_connection_timeout_timer(
        self: &Arc<Self>,
        peer: String,
        generation: u64,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let clock = Arc::clone(&self.clock);
        let timeout = self.options.connection_timeout;
        tokio::spawn(async move {
            clock.sleep(timeout).await;
            this.on_connection_timeout(peer, generation).await;
        })
    }

    async fn on_connecting_failed(self: &Arc<Self>, peer: String, generation: u64, _reason: String) {
        self.transition_back_to_no_connection(&peer, generation, false).await;
        self.try_reconnecting(peer).await;
    }

    async fn on_connection_timeout(self: &Arc<Self>, peer: String, generation: u64) {
        let was_connecting = {
            let sessions = self.sessions.lock().await;
            matches!(sessions.get(&peer), Some(SessionState::Connecting(d)) if d.core.generation == generation)
        };
        if !was_connecting {
            return;
        }
        self.transition_back_to_no_connection(&peer, generation, false).await;
        self.try_reconnecting(peer).await;
    }

    async fn on_connection_established(
        self: &Arc<Self>,
        peer: String,
        generation: u64,
        connection: Arc<dyn Connection>,
    ) {
        let mut sessions = self.sessions.lock().await;
        let Some(state) = sessions.get(&peer) else { return; };
        if state.generation() != generation || !matches!(state, SessionState::Connecting(_)) {
            connection.close();
            return;
        }
        let old: ConnectingData = match sessions.remove(&peer) {
            Some(SessionState::Connecting(d)) => d,
            _ => unreachable!(),
        };
        let id = old.core.id.clone();
        let new_generation = old.core.next_generation();
        let timeout_timer = self.spawn_handshake_timeout_timer(peer.clone(), new_generation);
        let mut new_state = transition_to_handshaking(old, Arc::clone(&connection), timeout_timer);

        let expected = ExpectedSessionState {
            next_expected_seq: new_state.core.ack,
            next_sent_seq: Some(new_state.core.send_buffer.front().map(|m| m.seq).unwrap_or(new_state.core.seq)),
        };
        let req_payload = ControlPayload::HandshakeReq {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            session_id: new_state.core.id.clone(),
            expected_session_state: expected,
            metadata: self.handshake.metadata.clone(),
        }
        .to_value();
        let req = new_state.core.construct_control(0, None, req_payload);
        let encode_result = new_state.core.options.codec.to_buffer(&req);
        let max_payload_size_bytes = new_state.core.options.max_payload_size_bytes;

        match encode_result {
            Ok(bytes) => {
                sessions.insert(peer.clone(), SessionState::Handshaking(new_state));
                drop(sessions);
                self.emit_transition(StateName::Handshaking, &id);
                self.spawn_connection_reader(peer.clone(), Arc::clone(&connection));
                if !send_framed(&connection, bytes, max_payload_size_bytes).await {
                    self.delete_session_unhealthy(
                        &peer,
                        ProtocolError::MessageSendFailure("failed to send HANDSHAKE_REQ".to_owned()),
                    )
                    .await;
                }
            }
            Err(e) => {
                drop(sessions);
                connection.close();
                self.events.dispatch(Event::SessionStatus(SessionStatusEvent {
                    status: SessionStatusKind::Closed,
                    session_id: id,
                    peer: peer.clone(),
                }));
                self.events.dispatch(Event::ProtocolError(ProtocolError::HandshakeFailed {
                    code: None,
                    message: format!("failed to encode HANDSHAKE_REQ: {e}"),
                }));
            }
        }
    }

    fn spawn_handshake_timeout_timer(
        self: &Arc<Self>,
        peer: String,
        generation: u64,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let clock = Arc::clone(&self.clock);
        let timeout = self.options.handshake_timeout;
        tokio::spawn(async move {
            clock.sleep(timeout).await;
            this.on_handshake_timeout(peer, generation).await;
        })
    }

    async fn on_handshake_timeout(self: &Arc<Self>, peer: String, generation: u64) {
        let was_handshaking = {
            let sessions = self.sessions.lock().await;
            matches!(sessions.get(&peer), Some(SessionState::Handshaking(d)) if d.core.generation == generation)
        };
        if !was_handshaking {
            return;
        }
        self.delete_session_unhealthy(
            &peer,
            ProtocolError::HandshakeFailed {
                code: None,
                message: "handshake timed out".to_owned(),
            },
        )
        .await;
        self.try_reconnecting(peer).await;
    }

    fn spawn_connection_reader(self: &Arc<Self>, peer: String, connection: Arc<dyn Connection>) {
        let Some(mut rx) = connection.take_events() else { return; };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut deframer = Deframer::new(this.options.max_payload_size_bytes, this.options.max_buffer_size_bytes);
            while let Some(event) = rx.recv().await {
                match event {
                    ConnectionEvent::Data(bytes) => {
                        if deframer.push(&bytes).is_err() {
                            this.on_conn_closed(peer.clone(), &connection).await;
                            return;
                        }
                        loop {
                            match deframer.next_frame() {
                                Ok(Some(frame)) => this.handle_frame(&peer, &connection, &frame).await,
                                Ok(None) => break,
                                Err(_) => {
                                    this.on_conn_closed(peer.clone(), &connection).await;
                                    return;
                                }
                            }
                        }
                    }
                    ConnectionEvent::Closed | ConnectionEvent::Error(_) => {
                        this.on_conn_closed(peer.clone(), &connection).await;
                        return;
                    }
                }
            }
        });
    }

    /// Connections survive the `Handshaking -> Connected` transition
    /// unchanged, so a reader task identifies "is this still the
    /// connection currently installed for this peer?" by pointer
    /// identity rather than by the session's generation counter (which
    /// does bump across that transition).
    async fn handle_frame(self: &Arc<Self>, peer: &str, connection: &Arc<dyn Connection>, frame: &[u8]) {
        let codec: Arc<dyn Codec> = {
            let sessions = self.sessions.lock().await;
            let Some(state) = sessions.get(peer) else { return; };
            if !conn_is_current(state, connection) {
                return;
            }
            Arc::clone(&state.core().options.codec)
        };
        let msg = match codec.from_buffer(frame) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(peer, %e, "dropping malformed frame");
                return;
            }
        };
        self.handle_message(peer, connection, msg).await;
    }

    async fn handle_message(self: &Arc<Self>, peer: &str, connection: &Arc<dyn Connection>, msg: TransportMessage) {
        let mut sessions = self.sessions.lock().await;
        let Some(state) = sessions.get(peer) else { return; };
        if !conn_is_current(state, connection) {
            return;
        }
        let generation = state.generation();
        match state {
            SessionState::Handshaking(_) => {
                drop(sessions);
                self.handle_handshake_response(peer, generation, msg).await;
            }
            SessionState::Connected(data) => {
                let is_close = ControlPayload::from_value(&msg.payload)
                    .map(|p| matches!(p, ControlPayload::Close))
                    .unwrap_or(false);
                if is_close {
                    drop(sessions);
                    self.delete_session_after_peer_close(peer).await;
                    self.try_reconnecting(peer.to_owned()).await;
                    return;
                }
                data.heartbeat.on_inbound_message();
                let outcome = data.core.record_inbound(&msg);
                match outcome {
                    crate::session::InboundOutcome::Duplicate => {
                        tracing::debug!(peer, seq = msg.seq, "dropping duplicate message");
                    }
                    crate::session::InboundOutcome::Gap => {
                        drop(sessions);
                        self.delete_session_unhealthy(
                            peer,
                            ProtocolError::InvalidMessage(format!(
                                "expected seq {}, got {}",
                                data.core.ack, msg.seq
                            )),
                        )
                        .await;
                    }
                    crate::session::InboundOutcome::Accepted => {
                        if msg.is_ack_only() {
                            // ACK-only messages never reach the router.
                        } else {
                            self.events.dispatch(Event::Message(msg));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    async fn handle_handshake_response(self: &Arc<Self>, peer: &str, generation: u64, msg: TransportMessage) {
        let payload = ControlPayload::from_value(&msg.payload);
        let status = match payload {
            Ok(ControlPayload::HandshakeResp { status }) => status,
            _ => {
                self.delete_session_unhealthy(
                    peer,
                    ProtocolError::HandshakeFailed {
                        code: None,
                        message: "handshake response was not a well-formed HANDSHAKE_RESP".to_owned(),
                    },
                )
                .await;
                self.try_reconnecting(peer.to_owned()).await;
                return;
            }
        };

        match status {
            HandshakeStatus::Ok { session_id, .. } => {
                let session_id_matches = {
                    let sessions = self.sessions.lock().await;
                    sessions
                        .get(peer)
                        .map(|s| s.core().id == session_id)
                        .unwrap_or(false)
                };
                if !session_id_matches {
                    self.delete_session_unhealthy(
                        peer,
                        ProtocolError::HandshakeFailed {
                            code: None,
                            message: "HANDSHAKE_RESP sessionId did not match local session".to_owned(),
                        },
                    )
                    .await;
                    self.try_reconnecting(peer.to_owned()).await;
                    return;
                }

                let mut sessions = self.sessions.lock().await;
                let Some(state) = sessions.get(peer) else { return; };
                if state.generation() != generation {
                    return;
                }
                let old: HandshakingData = match sessions.remove(peer) {
                    Some(SessionState::Handshaking(d)) => d,
                    _ => unreachable!(),
                };
                let id = old.core.id.clone();
                let connection = Arc::clone(&old.connection);
                let heartbeats_until_dead = old.core.options.heartbeats_until_dead;
                let new_state = transition_to_connected(old.core, connection, heartbeats_until_dead);
                let new_generation = new_state.core.generation;

                let pending: Vec<TransportMessage> = new_state.core.send_buffer.iter().cloned().collect();
                sessions.insert(peer.to_owned(), SessionState::Connected(new_state));
                drop(sessions);

                self.emit_transition(StateName::Connected, &id);
                self.retry_budget_for(peer).await.start_restoring_budget();
                self.spawn_heartbeat_ticker(peer.to_owned(), new_generation);

                for pending_msg in pending {
                    let sessions = self.sessions.lock().await;
                    let Some(SessionState::Connected(data)) = sessions.get(peer) else { break; };
                    let encoded = data.core.options.codec.to_buffer(&pending_msg);
                    let max_payload_size_bytes = data.core.options.max_payload_size_bytes;
                    let connection = Arc::clone(&data.connection);
                    drop(sessions);
                    let ok = match encoded {
                        Ok(bytes) => send_framed(&connection, bytes, max_payload_size_bytes).await,
                        Err(_) => false,
                    };
                    if !ok {
                        self.delete_session_unhealthy(
                            peer,
                            ProtocolError::MessageSendFailure("failed to flush buffered message on reconnect".to_owned()),
                        )
                        .await;
                        return;
                    }
                }
            }
            HandshakeStatus::Err { code, reason, .. } => {
                if code.is_retriable() {
                    self.delete_session_quiet(peer).await;
                    self.try_reconnecting(peer.to_owned()).await;
                } else {
                    self.delete_session_unhealthy(
                        peer,
                        ProtocolError::HandshakeFailed {
                            code: Some(code),
                            message: reason,
                        },
                    )
                    .await;
                }
            }
        }
    }

    fn spawn_heartbeat_ticker(self: &Arc<Self>, peer: String, generation: u64) {
        let this = Arc::clone(self);
        let clock = Arc::clone(&self.clock);
        let interval = self.options.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                clock.sleep(interval).await;
                if !this.on_heartbeat_tick(&peer, generation).await {
                    return;
                }
            }
        });
    }

    /// Returns `false` once the session is gone / no longer this
    /// generation's `Connected`, so the ticker loop can stop itself.
    async fn on_heartbeat_tick(self: &Arc<Self>, peer: &str, generation: u64) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(SessionState::Connected(data)) = sessions.get_mut(peer) else { return false; };
        if data.core.generation != generation {
            return false;
        }
        match data.heartbeat.on_tick() {
            crate::heartbeat::HeartbeatAction::CloseConnection => {
                data.connection.close();
                true
            }
            crate::heartbeat::HeartbeatAction::SendAck => {
                let ack = data.core.construct_ack();
                let encoded = data.core.options.codec.to_buffer(&ack);
                let max_payload_size_bytes = data.core.options.max_payload_size_bytes;
                let connection = Arc::clone(&data.connection);
                drop(sessions);
                if let Ok(bytes) = encoded {
                    send_framed(&connection, bytes, max_payload_size_bytes).await;
                }
                true
            }
        }
    }

    async fn on_conn_closed(self: &Arc<Self>, peer: String, connection: &Arc<dyn Connection>) {
        let (generation, was_connected_state) = {
            let sessions = self.sessions.lock().await;
            match sessions.get(&peer) {
                Some(state) if conn_is_current(state, connection) => {
                    (state.generation(), matches!(state, SessionState::Connected(_)))
                }
                _ => return,
            }
        };
        self.transition_back_to_no_connection(&peer, generation, was_connected_state).await;
        self.try_reconnecting(peer).await;
    }

    /// `Connecting | Handshaking | Connected -> NoConnection` (client
    /// transition 5).
    async fn transition_back_to_no_connection(self: &Arc<Self>, peer: &str, generation: u64, was_connected: bool) {
        let mut sessions = self.sessions.lock().await;
        let Some(state) = sessions.get(peer) else { return; };
        if state.generation() != generation {
            return;
        }
        state.cancel_timers();
        if let Some(conn) = state.connection() {
            conn.close();
        }
        let old_state = sessions.remove(peer).unwrap();
        let id = old_state.core().id.clone();
        let grace = old_state.core().options.session_disconnect_grace;
        let now = self.clock.now();
        let core = match old_state {
            SessionState::NoConnection(d) => d.core,
            SessionState::BackingOff(d) => d.core,
            SessionState::Connecting(d) => d.core,
            SessionState::Handshaking(d) => d.core,
            SessionState::Connected(d) => d.core,
            SessionState::WaitingForHandshake(d) => d.core,
        };
        let new_state = transition_to_no_connection(core, was_connected, grace, now);
        let grace_remaining = new_state.core.grace_remaining(now);
        sessions.insert(peer.to_owned(), SessionState::NoConnection(new_state));
        let grace_generation = sessions.get(peer).unwrap().generation();
        drop(sessions);
        self.emit_transition(StateName::NoConnection, &id);
        self.spawn_grace_timer(peer.to_owned(), grace_generation, grace_remaining);
    }

    fn spawn_grace_timer(self: &Arc<Self>, peer: String, generation: u64, remaining: Duration) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let clock = Arc::clone(&self.clock);
        tokio::spawn(async move {
            clock.sleep(remaining).await;
            this.on_session_grace_period_elapsed(peer, generation).await;
        })
    }

    async fn on_session_grace_period_elapsed(self: &Arc<Self>, peer: String, generation: u64) {
        let still_ungraced = {
            let sessions = self.sessions.lock().await;
            matches!(sessions.get(&peer), Some(SessionState::NoConnection(d)) if d.core.generation == generation)
        };
        if !still_ungraced {
            return;
        }
        self.delete_session_quiet(&peer).await;
    }

    /// `tryReconnecting(to)` (spec §4.6): respects `reconnectOnConnectionDrop`
    /// and obeys `enableTransparentSessionReconnects` — if that's false the
    /// old session is deleted first so the next attempt starts with
    /// `seq=ack=0`.
    async fn try_reconnecting(self: &Arc<Self>, peer: String) {
        if self.closed.load(Ordering::SeqCst) || !self.options.reconnect_on_connection_drop {
            return;
        }
        if !self.options.enable_transparent_session_reconnects {
            self.delete_session_quiet(&peer).await;
        }
        let client = ClientTransport { inner: Arc::clone(self) };
        client.connect(&peer).await;
    }
}

/// Sends a best-effort `CLOSE` control message ahead of a graceful
/// teardown (spec §3 `[ADDED]`: "sent by either peer immediately before
/// it calls `Connection::close()` as a courtesy"). No-op for any state
/// that is not `Connected` — a session with no live connection has no one
/// to tell.
async fn send_close_courtesy(state: &SessionState) {
    if let SessionState::Connected(data) = state {
        let msg = data.core.construct_control(0, None, ControlPayload::Close.to_value());
        if let Ok(bytes) = data.core.options.codec.to_buffer(&msg) {
            let _ = send_framed(&data.connection, bytes, data.core.options.max_payload_size_bytes).await;
        }
    }
}

/// Wraps an already-encoded message in the wire's length-prefix framing
/// before handing it to the connection. An oversized-after-encoding
/// payload is treated the same as any other send failure — callers
/// already react to `false` by tearing the session down.
async fn send_framed(connection: &Arc<dyn Connection>, bytes: Vec<u8>, max_payload_size_bytes: usize) -> bool {
    match encode_frame(&bytes, max_payload_size_bytes) {
        Ok(frame) => connection.send(frame).await,
        Err(_) => false,
    }
}

/// `true` iff `connection` is the one currently installed for `state`
/// (spec §8, Connection ownership: at most one installed listener at any
/// instant — this is how a reader task recognizes it has been
/// superseded).
fn conn_is_current(state: &SessionState, connection: &Arc<dyn Connection>) -> bool {
    state
        .connection()
        .map(|c| Arc::ptr_eq(c, connection))
        .unwrap_or(false)
}
