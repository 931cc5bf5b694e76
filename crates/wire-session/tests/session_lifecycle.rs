//! End-to-end session lifecycle tests driven entirely over
//! `wire-test-support`'s in-memory connection pair and virtual clock — no
//! real socket, no real timer.
//!
//! Tests:
//! 1. Basic send is observed on the other side with the original payload
//! 2. Oversized client payload is rejected locally with a "client: " prefix
//! 3. Oversized server payload is rejected locally with a "server: " prefix
//! 4. A dropped connection reconnects transparently and resumes delivery
//! 5. A session destroyed after its disconnect grace gets a fresh id
//! 6. Two clients against one server are kept isolated from each other
//! 7. A transport-initiated close sends a courtesy CLOSE the peer observes
//!    as a clean session close, never as a protocol error

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;

use wire_session::{
    ClientHandshakeOptions, ClientTransport, Event, EventDispatcher, PartialMessage, ProtocolError,
    SendError, ServerHandshakeOptions, ServerTransport, SessionOptions, SessionStatusEvent,
    SessionStatusKind, Side,
};
use wire_test_support::{InMemoryConnection, InMemoryNetwork, TestClock};

/// Yields enough times for a chain of spawned tasks (lock acquire, channel
/// recv, connector round trip) to settle. Cheap and deterministic relative
/// to sprinkling real `tokio::time::sleep` calls through async test bodies.
async fn pump() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

fn message_sink(events: &EventDispatcher) -> Arc<StdMutex<Vec<wire_protocol::TransportMessage>>> {
    let store = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&store);
    events.on(move |ev| {
        if let Event::Message(msg) = ev {
            sink.lock().unwrap().push(msg.clone());
        }
    });
    store
}

fn status_sink(events: &EventDispatcher) -> Arc<StdMutex<Vec<SessionStatusEvent>>> {
    let store = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&store);
    events.on(move |ev| {
        if let Event::SessionStatus(status) = ev {
            sink.lock().unwrap().push(status.clone());
        }
    });
    store
}

fn protocol_error_sink(events: &EventDispatcher) -> Arc<StdMutex<Vec<ProtocolError>>> {
    let store = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&store);
    events.on(move |ev| {
        if let Event::ProtocolError(err) = ev {
            sink.lock().unwrap().push(err.clone());
        }
    });
    store
}

struct Harness {
    clock: Arc<TestClock>,
    network: Arc<InMemoryNetwork>,
    server: ServerTransport,
}

impl Harness {
    fn new(options: Arc<SessionOptions>) -> Self {
        let clock = TestClock::new();
        let server_events = Arc::new(EventDispatcher::new());
        let server = ServerTransport::new(
            "SERVER",
            Arc::clone(&options),
            Arc::clone(&clock) as Arc<dyn wire_session::Clock>,
            server_events,
            ServerHandshakeOptions::default(),
        );
        let network = InMemoryNetwork::new(server.clone());
        Self { clock, network, server }
    }

    fn client(&self, id: &str, options: Arc<SessionOptions>) -> ClientTransport {
        ClientTransport::new(
            id.to_owned(),
            options,
            Arc::clone(&self.clock) as Arc<dyn wire_session::Clock>,
            Arc::clone(&self.network) as Arc<dyn wire_session::connection::ClientConnector>,
            Arc::new(EventDispatcher::new()),
            ClientHandshakeOptions::default(),
        )
    }

    /// Advances virtual time past the retry budget's backoff window and lets
    /// every spawned task settle.
    async fn settle_through_backoff(&self) {
        self.clock.advance(Duration::from_millis(600));
        pump().await;
    }
}

#[tokio::test]
async fn basic_send_is_observed_with_the_original_payload() {
    let options = Arc::new(SessionOptions::default());
    let harness = Harness::new(Arc::clone(&options));
    let client = harness.client("CLIENT", Arc::clone(&options));
    let server_messages = message_sink(harness.server.events());

    client.connect("SERVER").await;
    harness.settle_through_backoff().await;

    client
        .send("SERVER", PartialMessage::data(json!({"hello": "world"})))
        .await
        .expect("send should succeed once connected");
    pump().await;

    let received = server_messages.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, json!({"hello": "world"}));
    assert_eq!(received[0].seq, 0, "handshake frames must not consume a seq slot");
}

#[tokio::test]
async fn client_rejects_an_oversized_payload_before_touching_the_network() {
    let options = Arc::new(
        SessionOptions::builder()
            .max_payload_size_bytes(16)
            .build(),
    );
    let harness = Harness::new(Arc::clone(&options));
    let client = harness.client("CLIENT", Arc::clone(&options));
    let server_messages = message_sink(harness.server.events());

    let err = client
        .send("SERVER", PartialMessage::data(json!({"padding": "way more than 16 bytes of json"})))
        .await
        .expect_err("oversized payload must be rejected");

    match err {
        SendError::PayloadTooLarge(e) => {
            assert_eq!(e.side, Side::Client);
            assert!(format!("{e}").starts_with("client: "));
        }
        other => panic!("expected PayloadTooLarge, got {other:?}"),
    }

    pump().await;
    assert!(server_messages.lock().unwrap().is_empty(), "server must never see a rejected payload");
}

#[tokio::test]
async fn server_rejects_an_oversized_payload_before_touching_the_network() {
    let options = Arc::new(
        SessionOptions::builder()
            .max_payload_size_bytes(16)
            .build(),
    );
    let harness = Harness::new(Arc::clone(&options));
    let client = harness.client("CLIENT", Arc::clone(&options));
    let client_messages = message_sink(client.events());

    client.connect("SERVER").await;
    harness.settle_through_backoff().await;

    let err = harness
        .server
        .send("CLIENT", PartialMessage::data(json!({"padding": "way more than 16 bytes of json"})))
        .await
        .expect_err("oversized payload must be rejected");

    match err {
        SendError::PayloadTooLarge(e) => {
            assert_eq!(e.side, Side::Server);
            assert!(format!("{e}").starts_with("server: "));
        }
        other => panic!("expected PayloadTooLarge, got {other:?}"),
    }

    pump().await;
    assert!(client_messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn dropped_connection_reconnects_transparently_and_resumes_delivery() {
    let options = Arc::new(SessionOptions::default());
    let harness = Harness::new(Arc::clone(&options));
    let client = harness.client("CLIENT", Arc::clone(&options));
    let server_messages = message_sink(harness.server.events());
    let client_status = status_sink(client.events());

    client.connect("SERVER").await;
    harness.settle_through_backoff().await;

    client
        .send("SERVER", PartialMessage::data(json!({"seq": 1})))
        .await
        .unwrap();
    pump().await;
    assert_eq!(server_messages.lock().unwrap().len(), 1);

    // Simulate the underlying duplex failing (not a clean close) mid-session.
    let dropped = harness.network.connection_to("SERVER").await.expect("connected");
    dropped.fail("simulated network failure");
    pump().await;

    // Queued while disconnected; must not be lost.
    client
        .send("SERVER", PartialMessage::data(json!({"seq": 2})))
        .await
        .unwrap();

    harness.settle_through_backoff().await;

    let received = server_messages.lock().unwrap();
    assert_eq!(received.len(), 2, "both messages must eventually reach the server");
    assert_eq!(received[1].payload, json!({"seq": 2}));

    let statuses = client_status.lock().unwrap();
    assert!(
        !statuses.iter().any(|s| s.status == SessionStatusKind::Closed),
        "a transparent reconnect must never surface a sessionStatus{{closed}}"
    );
}

#[tokio::test]
async fn session_is_destroyed_after_its_grace_period_elapses() {
    let options = Arc::new(
        SessionOptions::builder()
            .reconnect_on_connection_drop(false)
            .session_disconnect_grace(Duration::from_millis(500))
            .build(),
    );
    let harness = Harness::new(Arc::clone(&options));
    let client = harness.client("CLIENT", Arc::clone(&options));
    let client_status = status_sink(client.events());

    client.connect("SERVER").await;
    harness.settle_through_backoff().await;

    let first_session_id = {
        let statuses = client_status.lock().unwrap();
        statuses
            .iter()
            .find(|s| s.status == SessionStatusKind::Created)
            .map(|s| s.session_id.clone())
            .expect("session must have been created")
    };

    let dropped = harness.network.connection_to("SERVER").await.expect("connected");
    dropped.fail("simulated network failure");
    pump().await;

    harness.clock.advance(Duration::from_millis(1000));
    pump().await;

    let closed: Vec<_> = client_status
        .lock()
        .unwrap()
        .iter()
        .filter(|s| s.status == SessionStatusKind::Closed)
        .cloned()
        .collect();
    assert_eq!(closed.len(), 1, "grace elapsing must destroy the session exactly once");
    assert_eq!(closed[0].session_id, first_session_id);

    client.connect("SERVER").await;
    harness.settle_through_backoff().await;
    let second_session_id = client_status
        .lock()
        .unwrap()
        .iter()
        .filter(|s| s.status == SessionStatusKind::Created)
        .last()
        .map(|s| s.session_id.clone())
        .expect("a fresh session must have been created");
    assert_ne!(first_session_id, second_session_id);
}

#[tokio::test]
async fn two_clients_against_one_server_stay_isolated() {
    let options = Arc::new(SessionOptions::default());
    let harness = Harness::new(Arc::clone(&options));
    let alice = harness.client("ALICE", Arc::clone(&options));
    let bob = harness.client("BOB", Arc::clone(&options));
    let server_messages = message_sink(harness.server.events());

    alice.connect("SERVER").await;
    bob.connect("SERVER").await;
    harness.settle_through_backoff().await;

    alice
        .send("SERVER", PartialMessage::data(json!({"from": "alice"})))
        .await
        .unwrap();
    bob.send("SERVER", PartialMessage::data(json!({"from": "bob"})))
        .await
        .unwrap();
    pump().await;

    let received = server_messages.lock().unwrap();
    assert_eq!(received.len(), 2);
    assert!(received.iter().any(|m| m.from == "ALICE" && m.payload == json!({"from": "alice"})));
    assert!(received.iter().any(|m| m.from == "BOB" && m.payload == json!({"from": "bob"})));

    harness
        .server
        .send("ALICE", PartialMessage::data(json!({"to": "alice only"})))
        .await
        .unwrap();
    pump().await;

    let alice_messages = message_sink(alice.events());
    let bob_messages = message_sink(bob.events());
    // Registered after the send above, so replay a fresh round trip to
    // confirm routing without relying on the earlier (now-drained) dispatch.
    harness
        .server
        .send("BOB", PartialMessage::data(json!({"to": "bob only"})))
        .await
        .unwrap();
    pump().await;
    assert!(bob_messages.lock().unwrap().iter().any(|m| m.payload == json!({"to": "bob only"})));
    assert!(alice_messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn client_close_sends_a_courtesy_close_the_server_observes_cleanly() {
    let options = Arc::new(SessionOptions::default());
    let harness = Harness::new(Arc::clone(&options));
    let client = harness.client("CLIENT", Arc::clone(&options));
    let server_status = status_sink(harness.server.events());
    let server_errors = protocol_error_sink(harness.server.events());

    client.connect("SERVER").await;
    harness.settle_through_backoff().await;

    client.close().await;
    pump().await;

    let closed: Vec<_> = server_status
        .lock()
        .unwrap()
        .iter()
        .filter(|s| s.status == SessionStatusKind::Closed)
        .cloned()
        .collect();
    assert_eq!(closed.len(), 1, "server must observe exactly one clean session close");
    assert!(
        server_errors.lock().unwrap().is_empty(),
        "a courteous CLOSE must never surface as a protocolError on the peer"
    );
}
