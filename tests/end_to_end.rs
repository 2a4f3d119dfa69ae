//! End-to-end tests against the public crate API.
//!
//! Everything in here goes through `pipehub::{PipeBroker, PipeClient,
//! Envelope}` exactly as an embedding application would — no crate
//! internals, no raw sockets. The crate-internal integration tests cover
//! misbehaving peers; these cover the documented happy paths.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use pipehub::envelope::Envelope;
use pipehub::{BrokerConfig, PipeBroker, PipeClient};

/// Poll `cond` every 10 ms until it holds or `timeout` expires.
fn poll_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Start a broker on a fresh socket under a private temp dir.
///
/// The `TempDir` must outlive the broker; dropping it deletes the socket.
fn started_broker() -> (Arc<PipeBroker>, tempfile::TempDir) {
    let tmp = tempfile::TempDir::new().expect("create temp dir");
    let broker = Arc::new(PipeBroker::new(BrokerConfig::at_path(
        tmp.path().join("hub.sock"),
    )));
    assert!(broker.start().expect("broker must start"));
    (broker, tmp)
}

#[test]
fn test_ping_round_trip() {
    let (broker, _tmp) = started_broker();

    // ── 1. connect and bind ──
    let mut client =
        PipeClient::connect(broker.socket_path(), "CLI-001").expect("connect and bind");
    assert!(
        poll_until(Duration::from_secs(2), || broker.client_count() == 1),
        "handshake should bind the client"
    );
    // The handshake frame itself must never surface as a message.
    assert!(broker.try_pop_received().is_none());

    // ── 2. client → broker ──
    client.send(br#"{"action":"ping"}"#).expect("send ping");

    let msg = broker
        .wait_and_pop_received()
        .expect("ping should reach the inbox");
    assert_eq!(msg.client_id, "CLI-001");
    assert_eq!(msg.payload, br#"{"action":"ping"}"#);
    assert!(msg.timestamp_ms > 0);

    // ── 3. broker → client ──
    assert!(broker.send_to_client(&msg.client_id, br#"{"action":"pong"}"#));
    let reply = client.recv().expect("receive reply");
    assert_eq!(reply, br#"{"action":"pong"}"#);

    broker.stop();
}

#[test]
fn test_envelope_request_response() {
    let (broker, _tmp) = started_broker();

    // Host side: answer every request with a response echoing the params,
    // driven from the inbox the way the `serve` subcommand does it.
    let host_broker = Arc::clone(&broker);
    let host = thread::spawn(move || {
        while let Some(msg) = host_broker.wait_and_pop_received() {
            if let Ok(Envelope::Request { msg_id, payload, .. }) = Envelope::decode(&msg.payload) {
                let reply = Envelope::response_to(
                    &msg_id,
                    &msg.client_id,
                    json!({ "status": "ok", "echo": payload.params }),
                );
                host_broker.send_to_client(&msg.client_id, &reply.encode());
            }
        }
    });

    let mut client = PipeClient::connect(broker.socket_path(), "app-1").expect("connect");
    let request = Envelope::request("app-1", "status", json!({ "verbose": true }));
    let request_id = match &request {
        Envelope::Request { msg_id, .. } => msg_id.clone(),
        _ => unreachable!(),
    };
    client.send(&request.encode()).expect("send request");

    let reply = Envelope::decode(&client.recv().expect("receive response"))
        .expect("reply should be an envelope");
    match reply {
        Envelope::Response { msg_id, payload, .. } => {
            assert_eq!(msg_id, request_id, "response must carry the request's msgId");
            assert_eq!(payload["status"], "ok");
            assert_eq!(payload["echo"]["verbose"], true);
        }
        other => panic!("expected a Response, got {other:?}"),
    }

    broker.stop();
    host.join().expect("host thread");
}

#[test]
fn test_broadcast_reaches_all_clients() {
    let (broker, _tmp) = started_broker();

    let mut clients: Vec<PipeClient> = (0..3)
        .map(|i| {
            PipeClient::connect(broker.socket_path(), &format!("worker-{i}")).expect("connect")
        })
        .collect();
    assert!(
        poll_until(Duration::from_secs(2), || broker.client_count() == 3),
        "all three handshakes should bind"
    );

    assert_eq!(broker.broadcast(b"reload"), 3);
    for client in &mut clients {
        assert_eq!(client.recv().expect("broadcast frame"), b"reload");
    }

    broker.stop();
}

#[test]
fn test_send_to_disconnected_client_returns_false() {
    let (broker, _tmp) = started_broker();

    {
        let _client = PipeClient::connect(broker.socket_path(), "transient").expect("connect");
        assert!(poll_until(Duration::from_secs(2), || broker.client_count() == 1));
        assert!(broker.send_to_client("transient", b"hi"));
    } // client drops here, closing its socket

    assert!(
        poll_until(Duration::from_secs(2), || broker.client_count() == 0),
        "broker should notice the hangup and unbind the client"
    );
    assert!(!broker.send_to_client("transient", b"too late"));
    assert!(!broker.send_to_client("never-existed", b"nope"));

    broker.stop();
}

#[test]
fn test_stop_unblocks_external_receiver() {
    let (broker, _tmp) = started_broker();

    let waiter_broker = Arc::clone(&broker);
    let waiter = thread::spawn(move || waiter_broker.wait_and_pop_received());

    thread::sleep(Duration::from_millis(50));
    broker.stop();

    let started = Instant::now();
    let popped = waiter.join().expect("waiter thread");
    assert!(popped.is_none(), "shutdown must yield the closed result");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "waiter must be released promptly after stop"
    );
}
