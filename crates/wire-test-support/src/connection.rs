//! An in-memory [`Connection`] pair, wired directly to each other through
//! `tokio::sync::mpsc` channels — generalizes the reference stack's own
//! mock WS client/server (`rt-test-utils`), which exists for exactly this
//! reason: exercising session-level protocol logic without a real socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use wire_session::{ClientConnector, Connection, ConnectionEvent};

/// One end of an in-memory duplex. `send` on this end delivers a `Data`
/// event to the peer's event queue; `close` delivers a `Closed` event to
/// the peer and marks this end dead so further sends are refused.
#[derive(Debug)]
pub struct InMemoryConnection {
    peer_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    closed: AtomicBool,
}

impl InMemoryConnection {
    /// Builds a connected pair: sending on one delivers to the other's
    /// event stream, and vice versa.
    pub fn pair() -> (Arc<InMemoryConnection>, Arc<InMemoryConnection>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Arc::new(InMemoryConnection {
            peer_tx: b_tx,
            events_rx: Mutex::new(Some(a_rx)),
            closed: AtomicBool::new(false),
        });
        let b = Arc::new(InMemoryConnection {
            peer_tx: a_tx,
            events_rx: Mutex::new(Some(b_rx)),
            closed: AtomicBool::new(false),
        });
        (a, b)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulates the underlying byte-duplex failing (as opposed to a
    /// clean `close()`): delivers `Error` then `Closed` to the peer, per
    /// spec §4.3 ("Close MUST also fire after any error").
    pub fn fail(&self, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.peer_tx.send(ConnectionEvent::Error(reason.into()));
        let _ = self.peer_tx.send(ConnectionEvent::Closed);
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn send(&self, bytes: Bytes) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.peer_tx.send(ConnectionEvent::Data(bytes)).is_ok()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.peer_tx.send(ConnectionEvent::Closed);
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.try_lock().ok()?.take()
    }
}

/// Minimal in-process "network": a [`ClientConnector`] that, on
/// `connect`, builds an [`InMemoryConnection`] pair and hands one end
/// straight to a [`wire_session::ServerTransport`] via
/// `handle_connection`, returning the other end to the caller — the same
/// role the reference stack's `MockWsServer`/`MockWsClient` pair plays for
/// its own websocket protocol, minus the actual socket.
pub struct InMemoryNetwork {
    server: wire_session::ServerTransport,
    connections: Mutex<std::collections::HashMap<String, Arc<InMemoryConnection>>>,
}

impl InMemoryNetwork {
    pub fn new(server: wire_session::ServerTransport) -> Arc<Self> {
        Arc::new(Self {
            server,
            connections: Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Returns the client-side end of the connection most recently
    /// established toward `peer`, if any — lets a test simulate a network
    /// drop (`fail`) or a clean close (`close`) from outside the client
    /// transport, exactly as S4/S5 in spec §8 require.
    pub async fn connection_to(&self, peer: &str) -> Option<Arc<InMemoryConnection>> {
        self.connections.lock().await.get(peer).cloned()
    }
}

#[async_trait]
impl ClientConnector for InMemoryNetwork {
    async fn connect(&self, to: &str) -> Result<Arc<dyn Connection>, String> {
        let (client_end, server_end) = InMemoryConnection::pair();
        self.connections
            .lock()
            .await
            .insert(to.to_owned(), Arc::clone(&client_end));
        self.server.handle_connection(server_end).await;
        Ok(client_end)
    }
}
