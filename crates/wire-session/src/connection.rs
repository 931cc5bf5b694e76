//! `Connection` collaborator: a minimal byte-duplex contract. Concrete
//! transports (websocket, unix socket, TCP, in-memory pipe) implement this
//! trait; the core never depends on any of them directly.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Events pushed out of a [`Connection`]'s single listener slot. A
/// connection has at most one installed listener at any instant — see
/// [`Connection::take_events`].
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Data(Bytes),
    Closed,
    Error(String),
}

/// A byte-duplex with `send`/`close` and exactly one installable event
/// listener. Close MUST also fire (an `Closed` event, possibly preceded by
/// an `Error`) after any error.
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Best-effort send. `false` means the underlying channel refused
    /// (e.g. already closed) — the caller does not retry internally.
    async fn send(&self, bytes: Bytes) -> bool;

    fn close(&self);

    /// Installs the event listener for this connection by taking its
    /// receiver end. Returns `None` if a listener has already been
    /// installed and not yet released — enforcing "at most one installed
    /// listener at any instant" (spec §8, Connection ownership).
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;
}

/// Client-side collaborator that opens a new outgoing [`Connection`] to a
/// named peer — the concrete websocket/unix-socket/TCP dialer, injected so
/// `ClientTransport` never depends on a specific transport (spec §4.6,
/// `createNewOutgoingConnection(to)`).
#[async_trait]
pub trait ClientConnector: Send + Sync {
    async fn connect(&self, to: &str) -> Result<std::sync::Arc<dyn Connection>, String>;
}
