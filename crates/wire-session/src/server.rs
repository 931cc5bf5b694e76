//! Server transport (spec §4.7): accepts connections, holds
//! pending-handshake sessions, and speaks the handshake-response side of
//! the protocol. The server never initiates `connect` — it only reacts to
//! `handle_connection` and to its own identified sessions going
//! unhealthy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use wire_protocol::{
    control_flags, encode_frame, Codec, ControlPayload, Deframer, HandshakeErrorCode,
    HandshakeStatus, TransportMessage, PROTOCOL_VERSION,
};

use crate::clock::Clock;
use crate::connection::{Connection, ConnectionEvent};
use crate::error::{HandshakeFailure, MaxPayloadSizeExceeded, ProtocolError, SendError, Side};
use crate::events::{
    Event, EventDispatcher, SessionStatusEvent, SessionStatusKind, SessionTransitionEvent,
    TransportStatusKind,
};
use crate::options::SessionOptions;
use crate::session::state::{new_waiting_for_handshake, transition_to_connected};
use crate::session::{PartialMessage, SessionCore, SessionState, StateName};

/// Validates an incoming handshake's metadata, with access to the
/// previously-stored metadata on reconnect (spec §4.5/§4.7: "run the
/// user-supplied `validate(metadata, previousParsedMetadata?)`").
pub trait HandshakeValidator: Send + Sync {
    fn validate(
        &self,
        metadata: Option<&serde_json::Value>,
        previous_metadata: Option<&serde_json::Value>,
    ) -> Result<(), HandshakeFailure>;
}

/// Accepts everything — the default when no validator is configured.
pub struct AcceptAllValidator;

impl HandshakeValidator for AcceptAllValidator {
    fn validate(
        &self,
        _metadata: Option<&serde_json::Value>,
        _previous_metadata: Option<&serde_json::Value>,
    ) -> Result<(), HandshakeFailure> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct ServerHandshakeOptions {
    pub validator: Arc<dyn HandshakeValidator>,
}

impl Default for ServerHandshakeOptions {
    fn default() -> Self {
        Self {
            validator: Arc::new(AcceptAllValidator),
        }
    }
}

#[derive(Clone)]
pub struct ServerTransport {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    server_id: String,
    options: Arc<SessionOptions>,
    clock: Arc<dyn Clock>,
    events: Arc<EventDispatcher>,
    handshake: ServerHandshakeOptions,
    sessions: Mutex<HashMap<String, SessionState>>,
    /// Last accepted handshake metadata per peer, kept around so a later
    /// reconnect's validator call can see `previous_metadata` (spec
    /// §4.7).
    last_metadata: Mutex<HashMap<String, serde_json::Value>>,
    closed: AtomicBool,
}

impl ServerTransport {
    pub fn new(
        server_id: impl Into<String>,
        options: Arc<SessionOptions>,
        clock: Arc<dyn Clock>,
        events: Arc<EventDispatcher>,
        handshake: ServerHandshakeOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                server_id: server_id.into(),
                options,
                clock,
                events,
                handshake,
                sessions: Mutex::new(HashMap::new()),
                last_metadata: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.inner.events
    }

    /// Called by the concrete byte-duplex server on accept (spec §4.7).
    /// Registers a pending, not-yet-identified connection and arms its
    /// `handshakeTimeoutMs` timer.
    pub async fn handle_connection(&self, connection: Arc<dyn Connection>) {
        if self.inner.closed.load(Ordering::SeqCst) {
            connection.close();
            return;
        }
        let pending_key = format!("pending-{}", uuid::Uuid::new_v4());
        let core = SessionCore::new(
            pending_key.clone(),
            self.inner.server_id.clone(),
            String::new(),
            Arc::clone(&self.inner.options),
        );
        let timeout_timer = self.inner.spawn_handshake_timeout_timer(pending_key.clone());
        let data = new_waiting_for_handshake(core, Arc::clone(&connection), timeout_timer);
        let mut sessions = self.inner.sessions.lock().await;
        sessions.insert(pending_key.clone(), SessionState::WaitingForHandshake(data));
        drop(sessions);
        self.inner
            .spawn_connection_reader(pending_key, Arc::clone(&connection));
    }

    /// `send(to, msg)` (spec §4.7). Errors iff the transport is closed, no
    /// session is identified for `to`, or the payload is too large.
    pub async fn send(&self, to: &str, partial: PartialMessage) -> Result<(), SendError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SendError::TransportClosed);
        }
        let mut sessions = self.inner.sessions.lock().await;
        let Some(state) = sessions.get_mut(to) else {
            return Err(SendError::TransportClosed);
        };
        match state {
            SessionState::Connected(data) => {
                let stamped = data
                    .core
                    .construct_checked(partial, data.core.options.codec.as_ref(), data.core.options.max_payload_size_bytes)
                    .map_err(|(size, max)| {
                        SendError::PayloadTooLarge(MaxPayloadSizeExceeded {
                            side: Side::Server,
                            size,
                            max,
                        })
                    })?;
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
                            side: Side::Server,
                            size,
                            max,
                        })
                    })?;
                core.buffer(stamped);
                Ok(())
            }
        }
    }

    /// Closes every identified session and cancels every pending
    /// handshake (spec §5: "Dropping a server transport cancels every
    /// pending handshake and every identified session").
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
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
        drop(sessions);
        self.inner
            .events
            .dispatch(Event::TransportStatus(TransportStatusKind::Closed));
    }
}

impl ServerInner {
    fn emit_transition(&self, state: StateName, id: &str) {
        self.events.dispatch(Event::SessionTransition(SessionTransitionEvent {
            state: state.into(),
            id: id.to_owned(),
        }));
    }

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

    async fn drop_pending(self: &Arc<Self>, key: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.remove(key) {
            state.cancel_timers();
            if let Some(conn) = state.connection() {
                conn.close();
            }
        }
    }

    fn spawn_handshake_timeout_timer(
        self: &Arc<Self>,
        key: String,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let clock = Arc::clone(&self.clock);
        let timeout = self.options.handshake_timeout;
        tokio::spawn(async move {
            clock.sleep(timeout).await;
            this.on_handshake_timeout(key).await;
        })
    }

    async fn on_handshake_timeout(self: &Arc<Self>, key: String) {
        let still_pending = {
            let sessions = self.sessions.lock().await;
            matches!(sessions.get(&key), Some(SessionState::WaitingForHandshake(_)))
        };
        if still_pending {
            self.drop_pending(&key).await;
        }
    }

    fn spawn_connection_reader(self: &Arc<Self>, key: String, connection: Arc<dyn Connection>) {
        let Some(mut rx) = connection.take_events() else { return; };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut deframer = Deframer::new(this.options.max_payload_size_bytes, this.options.max_buffer_size_bytes);
            let mut live_key = key;
            while let Some(event) = rx.recv().await {
                match event {
                    ConnectionEvent::Data(bytes) => {
                        if deframer.push(&bytes).is_err() {
                            this.on_conn_closed(&live_key, &connection).await;
                            return;
                        }
                        loop {
                            match deframer.next_frame() {
                                Ok(Some(frame)) => {
                                    if let Some(new_key) =
                                        this.handle_frame(&live_key, &connection, &frame).await
                                    {
                                        live_key = new_key;
                                    }
                                }
                                Ok(None) => break,
                                Err(_) => {
                                    this.on_conn_closed(&live_key, &connection).await;
                                    return;
                                }
                            }
                        }
                    }
                    ConnectionEvent::Closed | ConnectionEvent::Error(_) => {
                        this.on_conn_closed(&live_key, &connection).await;
                        return;
                    }
                }
            }
        });
    }

    /// Decodes one frame and dispatches it. Returns `Some(new_key)` when
    /// this call just identified a pending connection — the reader loop
    /// re-keys itself under the real peer id for subsequent frames.
    async fn handle_frame(
        self: &Arc<Self>,
        key: &str,
        connection: &Arc<dyn Connection>,
        frame: &[u8],
    ) -> Option<String> {
        let codec: Arc<dyn Codec> = {
            let sessions = self.sessions.lock().await;
            let state = sessions.get(key)?;
            if !conn_is_current(state, connection) {
                return None;
            }
            Arc::clone(&state.core().options.codec)
        };
        let msg = match codec.from_buffer(frame) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(key, %e, "dropping malformed frame");
                return None;
            }
        };
        self.handle_message(key, connection, msg).await
    }

    async fn handle_message(
        self: &Arc<Self>,
        key: &str,
        connection: &Arc<dyn Connection>,
        msg: TransportMessage,
    ) -> Option<String> {
        let is_waiting = {
            let sessions = self.sessions.lock().await;
            matches!(sessions.get(key), Some(SessionState::WaitingForHandshake(_)))
        };
        if is_waiting {
            return self.handle_handshake_request(key, connection, msg).await;
        }

        let mut sessions = self.sessions.lock().await;
        let Some(state) = sessions.get_mut(key) else { return None; };
        if !conn_is_current(state, connection) {
            return None;
        }
        if let SessionState::Connected(data) = state {
            let is_close = ControlPayload::from_value(&msg.payload)
                .map(|p| matches!(p, ControlPayload::Close))
                .unwrap_or(false);
            if is_close {
                drop(sessions);
                self.drop_identified_after_peer_close(key).await;
                return None;
            }
            data.heartbeat.on_inbound_message();
            match data.core.record_inbound(&msg) {
                crate::session::InboundOutcome::Duplicate => {
                    tracing::debug!(key, seq = msg.seq, "dropping duplicate message");
                }
                crate::session::InboundOutcome::Gap => {
                    drop(sessions);
                    self.delete_session_unhealthy(
                        key,
                        ProtocolError::InvalidMessage(format!(
                            "expected seq {}, got {}",
                            data.core.ack, msg.seq
                        )),
                    )
                    .await;
                }
                crate::session::InboundOutcome::Accepted => {
                    if msg.is_ack_only() {
                        // never delivered to the router
                    } else if msg.has_flag(control_flags::ACK) {
                        // passive heartbeat: mirror the ack back
                        let ack = data.core.construct_ack();
                        let encoded = data.core.options.codec.to_buffer(&ack);
                        let max_payload_size_bytes = data.core.options.max_payload_size_bytes;
                        let connection = Arc::clone(&data.connection);
                        drop(sessions);
                        if let Ok(bytes) = encoded {
                            send_framed(&connection, bytes, max_payload_size_bytes).await;
                        }
                    } else {
                        self.events.dispatch(Event::Message(msg));
                    }
                }
            }
        }
        None
    }

    async fn drop_identified(self: &Arc<Self>, key: &str) {
        self.drop_identified_inner(key, true).await;
    }

    /// As [`ServerInner::drop_identified`], but never sends a `CLOSE`
    /// courtesy message first — used when the session is being torn down
    /// *because* the peer already sent us one.
    async fn drop_identified_after_peer_close(self: &Arc<Self>, key: &str) {
        self.drop_identified_inner(key, false).await;
    }

    async fn drop_identified_inner(self: &Arc<Self>, key: &str, send_courtesy: bool) {
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.remove(key) {
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
                peer: key.to_owned(),
            }));
        }
    }

    async fn on_conn_closed(self: &Arc<Self>, key: &str, connection: &Arc<dyn Connection>) {
        let matches_current = {
            let sessions = self.sessions.lock().await;
            matches!(sessions.get(key), Some(state) if conn_is_current(state, connection))
        };
        if !matches_current {
            return;
        }
        let is_waiting = {
            let sessions = self.sessions.lock().await;
            matches!(sessions.get(key), Some(SessionState::WaitingForHandshake(_)))
        };
        if is_waiting {
            self.drop_pending(key).await;
        } else {
            self.drop_identified(key).await;
        }
    }

    /// Server-side handshake algorithm (spec §4.5, §4.7). On success,
    /// returns the new peer-id key the reader loop should use from here
    /// on (replacing the opaque `pending-<uuid>` key).
    async fn handle_handshake_request(
        self: &Arc<Self>,
        pending_key: &str,
        connection: &Arc<dyn Connection>,
        msg: TransportMessage,
    ) -> Option<String> {
        let req = match ControlPayload::from_value(&msg.payload) {
            Ok(ControlPayload::HandshakeReq {
                protocol_version,
                session_id,
                expected_session_state,
                metadata,
            }) => (protocol_version, session_id, expected_session_state, metadata),
            _ => {
                self.reject_pending(
                    pending_key,
                    connection,
                    HandshakeFailure::Malformed("payload was not a HANDSHAKE_REQ".to_owned()),
                )
                .await;
                return None;
            }
        };
        let (protocol_version, session_id, expected_state, metadata) = req;

        if protocol_version != PROTOCOL_VERSION {
            self.reject_pending(
                pending_key,
                connection,
                HandshakeFailure::VersionMismatch {
                    expected: PROTOCOL_VERSION.to_owned(),
                    actual: protocol_version,
                },
            )
            .await;
            return None;
        }

        let from = msg.from.clone();
        let previous_metadata = self.last_metadata.lock().await.get(&from).cloned();
        if let Err(failure) = self.handshake.validator.validate(metadata.as_ref(), previous_metadata.as_ref()) {
            self.reject_pending(pending_key, connection, failure).await;
            return None;
        }

        let mut sessions = self.sessions.lock().await;
        let existing_session = sessions.remove(&from);

        // `next_sent_seq` is required for adoption per spec §9's Open
        // Question resolution; its absence is a non-matching state.
        let adopt = match (&existing_session, expected_state.next_sent_seq) {
            (Some(SessionState::NoConnection(existing)), Some(next_sent_seq)) => {
                expected_state.next_expected_seq == existing.core.seq
                    && next_sent_seq == existing.core.ack
            }
            _ => false,
        };

        if existing_session.is_some() && !adopt {
            // Put back whatever we removed — we are rejecting this
            // attempt, not tearing down the existing session.
            if let Some(state) = existing_session {
                sessions.insert(from.clone(), state);
            }
            drop(sessions);
            self.reject_pending(pending_key, connection, HandshakeFailure::SessionStateMismatch)
                .await;
            return None;
        }

        let core = match existing_session {
            Some(SessionState::NoConnection(existing)) => existing.core,
            _ => SessionCore::new(session_id.clone(), self.server_id.clone(), from.clone(), Arc::clone(&self.options)),
        };

        // Drop the pending placeholder entry before inserting under the
        // real peer key.
        if let Some(pending) = sessions.remove(pending_key) {
            pending.cancel_timers();
        }

        let new_state = transition_to_connected(core, Arc::clone(connection), self.options.heartbeats_until_dead);
        let id = new_state.core.id.clone();
        sessions.insert(from.clone(), SessionState::Connected(new_state));
        drop(sessions);

        if let Some(meta) = metadata {
            self.last_metadata.lock().await.insert(from.clone(), meta);
        }

        self.emit_transition(StateName::Connected, &id);

        let resp_payload = ControlPayload::HandshakeResp {
            status: HandshakeStatus::ok(session_id),
        }
        .to_value();
        let (encoded_ok, max_payload_size_bytes) = {
            let mut sessions = self.sessions.lock().await;
            if let Some(SessionState::Connected(data)) = sessions.get_mut(&from) {
                let resp = data.core.construct_control(0, None, resp_payload);
                (data.core.options.codec.to_buffer(&resp), data.core.options.max_payload_size_bytes)
            } else {
                return None;
            }
        };
        match encoded_ok {
            Ok(bytes) => {
                send_framed(connection, bytes, max_payload_size_bytes).await;
            }
            Err(_) => {
                self.delete_session_unhealthy(
                    &from,
                    ProtocolError::MessageSendFailure("failed to encode HANDSHAKE_RESP".to_owned()),
                )
                .await;
                return None;
            }
        }
        Some(from)
    }

    async fn reject_pending(
        self: &Arc<Self>,
        pending_key: &str,
        connection: &Arc<dyn Connection>,
        failure: HandshakeFailure,
    ) {
        let code = failure.code();
        let resp_payload = ControlPayload::HandshakeResp {
            status: HandshakeStatus::err(failure.to_string(), code),
        }
        .to_value();
        let codec_and_max: Option<(Arc<dyn Codec>, usize)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(pending_key)
                .map(|s| (Arc::clone(&s.core().options.codec), s.core().options.max_payload_size_bytes))
        };
        if let Some((codec, max_payload_size_bytes)) = codec_and_max {
            let envelope = TransportMessage {
                id: "handshake-reject".to_owned(),
                from: self.server_id.clone(),
                to: String::new(),
                seq: 0,
                ack: 0,
                service_name: None,
                procedure_name: None,
                stream_id: None,
                control_flags: 0,
                tracing: None,
                payload: resp_payload,
            };
            if let Ok(bytes) = codec.to_buffer(&envelope) {
                let _ = send_framed(connection, bytes, max_payload_size_bytes).await;
            }
        }
        if !code.is_retriable() {
            self.events.dispatch(Event::ProtocolError(ProtocolError::HandshakeFailed {
                code: Some(code),
                message: failure.to_string(),
            }));
        }
        self.drop_pending(pending_key).await;
        connection.close();
    }
}

/// Sends a best-effort `CLOSE` control message ahead of a graceful
/// teardown (spec §3 `[ADDED]`: "sent by either peer immediately before
/// it calls `Connection::close()` as a courtesy"). No-op for any state
/// that is not `Connected`.
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
/// payload is treated the same as any other send failure.
async fn send_framed(connection: &Arc<dyn Connection>, bytes: Vec<u8>, max_payload_size_bytes: usize) -> bool {
    match encode_frame(&bytes, max_payload_size_bytes) {
        Ok(frame) => connection.send(frame).await,
        Err(_) => false,
    }
}

fn conn_is_current(state: &SessionState, connection: &Arc<dyn Connection>) -> bool {
    state
        .connection()
        .map(|c| Arc::ptr_eq(c, connection))
        .unwrap_or(false)
}
