//! Per-connection state and I/O workers.
//!
//! Each accepted socket gets one [`ClientConn`] and a pair of dedicated
//! threads:
//!
//! ```text
//! accept ──► ClientConn (unbound)
//!                │
//!        conn-read-{id} thread ──spawns──► conn-write-{id} thread
//!                │                               │
//!        read + decode frames            drain outbox, frame, write
//!                │                               │
//!        first frame = handshake         100ms poll to observe flags
//!        later frames → inbox            write error is fatal
//!                │                               │
//!                └──── reader joins writer, then close() ────┘
//! ```
//!
//! The read worker owns frame decoding and the handshake. The write worker
//! owns the socket's outbound half through a cloned handle. Either side
//! failing tears the whole connection down; `close` is idempotent and safe
//! to call concurrently from the workers, the broker, or `stop`.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::broker::{now_ms, BrokerShared, Message, MAX_CLIENT_ID_BYTES};
use crate::framing::{encode_frame, FrameDecoder};

/// How long the write worker parks between outbox polls. Short enough that
/// shutdown is observed promptly even without a notification.
const OUTBOX_POLL: Duration = Duration::from_millis(100);

// ─── ClientConn ────────────────────────────────────────────────────────────

/// One accepted peer connection.
///
/// `id` is a broker-unique handle that outlives any client identifier
/// binding; registry removal compares it so a superseded connection can
/// never evict its successor's entry.
pub(crate) struct ClientConn {
    id: u64,
    stream: UnixStream,
    bound_id: Mutex<Option<String>>,
    outbox: Mutex<VecDeque<Message>>,
    outbox_ready: Condvar,
    alive: AtomicBool,
}

impl ClientConn {
    pub(crate) fn new(id: u64, stream: UnixStream) -> Self {
        Self {
            id,
            stream,
            bound_id: Mutex::new(None),
            outbox: Mutex::new(VecDeque::new()),
            outbox_ready: Condvar::new(),
            alive: AtomicBool::new(true),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Client identifier this connection is bound to, if the handshake has
    /// completed.
    pub(crate) fn bound_id(&self) -> Option<String> {
        self.bound_id.lock().expect("bound_id mutex poisoned").clone()
    }

    /// Queue a message for the write worker. Returns `false` if the
    /// connection is already closed; the message is not queued.
    pub(crate) fn enqueue(&self, msg: Message) -> bool {
        if !self.is_alive() {
            return false;
        }
        let mut outbox = self.outbox.lock().expect("outbox mutex poisoned");
        outbox.push_back(msg);
        drop(outbox);
        self.outbox_ready.notify_one();
        true
    }

    /// Tear the connection down.
    ///
    /// Idempotent and callable from any thread. The first caller shuts the
    /// socket down (which unblocks a reader mid-read) and wakes the write
    /// worker; every caller re-runs the registry and table cleanup, which
    /// is conditional and therefore harmless to repeat.
    pub(crate) fn close(&self, shared: &BrokerShared) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.outbox_ready.notify_all();
            log::info!("[broker] conn {} closed", self.id);
        }

        if let Some(client_id) = self.bound_id() {
            if shared.registry.remove_if(&client_id, self.id) {
                log::info!("[broker] client '{client_id}' unregistered");
            }
        }
        shared
            .connections
            .lock()
            .expect("connections mutex poisoned")
            .remove(&self.id);
    }
}

// ─── Worker threads ────────────────────────────────────────────────────────

/// Spawn the read/write worker pair for a freshly accepted connection.
///
/// Workers are detached: the acceptor never supervises them. The read
/// worker owns the teardown sequence — it joins the write worker and runs
/// `close` on the way out, so both threads are gone by the time the
/// connection leaves the broker's tables.
pub(crate) fn spawn_workers(conn: Arc<ClientConn>, shared: Arc<BrokerShared>) {
    let write_stream = match conn.stream.try_clone() {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("[broker] conn {}: clone stream for writer: {e}", conn.id());
            conn.close(&shared);
            return;
        }
    };

    let read_conn = Arc::clone(&conn);
    let read_shared = Arc::clone(&shared);
    let spawned = thread::Builder::new()
        .name(format!("conn-read-{}", conn.id()))
        .spawn(move || {
            let write_conn = Arc::clone(&read_conn);
            let write_shared = Arc::clone(&read_shared);
            let writer = match thread::Builder::new()
                .name(format!("conn-write-{}", read_conn.id()))
                .spawn(move || write_loop(&write_conn, &write_shared, write_stream))
            {
                Ok(handle) => handle,
                Err(e) => {
                    log::error!("[broker] conn {}: spawn write worker: {e}", read_conn.id());
                    read_conn.close(&read_shared);
                    return;
                }
            };

            read_loop(&read_conn, &read_shared);

            // Reader is done: stop the writer, wait for it, then clean up.
            read_conn.alive.store(false, Ordering::SeqCst);
            read_conn.outbox_ready.notify_all();
            let _ = writer.join();
            read_conn.close(&read_shared);
        });

    if let Err(e) = spawned {
        log::error!("[broker] conn {}: spawn read worker: {e}", conn.id());
        conn.close(&shared);
    }
}

/// Blocking read loop: accumulate bytes, decode frames, dispatch payloads.
///
/// A read timeout is a recoverable stall (the socket carries a bounded
/// read timeout so this loop re-checks liveness flags periodically); EOF
/// and any other error end the loop.
fn read_loop(conn: &Arc<ClientConn>, shared: &Arc<BrokerShared>) {
    let mut buf = vec![0u8; shared.config.read_buffer_size];
    let mut decoder = FrameDecoder::new();
    let mut stream = &conn.stream;

    'outer: while conn.is_alive() && shared.is_running() {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                log::info!("[broker] conn {}: peer closed the stream", conn.id());
                break;
            }
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                log::warn!("[broker] conn {}: read error: {e}", conn.id());
                break;
            }
        };

        let payloads = match decoder.feed(&buf[..n]) {
            Ok(payloads) => payloads,
            Err(e) => {
                // Oversized frame declaration. Fatal to this connection
                // only; the payload bytes were never read.
                log::warn!("[broker] conn {}: {e}", conn.id());
                break;
            }
        };

        for payload in payloads {
            if !handle_payload(conn, shared, payload) {
                break 'outer;
            }
        }
    }
}

/// Dispatch one decoded payload. Returns `false` when the connection must
/// close.
///
/// The first payload on a connection is the bind handshake: a bare UTF-8
/// client identifier, consumed here and never delivered onward. An invalid
/// handshake (empty, oversized, or not UTF-8) is dropped and the
/// connection stays unbound, free to retry with its next frame.
fn handle_payload(conn: &Arc<ClientConn>, shared: &Arc<BrokerShared>, payload: Vec<u8>) -> bool {
    let Some(client_id) = conn.bound_id() else {
        match std::str::from_utf8(&payload) {
            Ok(id) if !id.is_empty() && payload.len() < MAX_CLIENT_ID_BYTES => {
                let id = id.to_string();
                *conn.bound_id.lock().expect("bound_id mutex poisoned") = Some(id.clone());
                shared.registry.bind(&id, conn);
                log::info!("[broker] conn {} bound as '{id}'", conn.id());
            }
            _ => {
                log::warn!(
                    "[broker] conn {}: invalid handshake frame ({} bytes), dropped",
                    conn.id(),
                    payload.len()
                );
            }
        }
        return true;
    };

    let msg = Message {
        client_id,
        payload,
        timestamp_ms: now_ms(),
    };

    let handler = {
        let guard = shared.handler.lock().expect("handler mutex poisoned");
        guard.as_ref().map(Arc::clone)
    };

    match handler {
        Some(handler) => {
            shared.inbox.push(msg.clone());
            // Handler runs synchronously on this read worker. A panic is
            // contained to this one connection.
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(&msg))).is_err() {
                log::error!(
                    "[broker] conn {}: message handler panicked, closing connection",
                    conn.id()
                );
                return false;
            }
        }
        None => shared.inbox.push(msg),
    }
    true
}

/// Blocking write loop: drain the outbox in FIFO order, frame and write.
///
/// Parks on the outbox condvar with a 100ms slice so it observes shutdown
/// without a notification. Any write error (including the socket's bounded
/// write timeout) is fatal; the in-flight message is dropped, delivery is
/// at-most-once.
fn write_loop(conn: &Arc<ClientConn>, shared: &Arc<BrokerShared>, mut stream: UnixStream) {
    while conn.is_alive() && shared.is_running() {
        let msg = {
            let outbox = conn.outbox.lock().expect("outbox mutex poisoned");
            let (mut outbox, _timed_out) = conn
                .outbox_ready
                .wait_timeout_while(outbox, OUTBOX_POLL, |queue| {
                    queue.is_empty() && conn.is_alive()
                })
                .expect("outbox mutex poisoned");
            if !conn.is_alive() {
                break;
            }
            match outbox.pop_front() {
                Some(msg) => msg,
                None => continue,
            }
        };

        let frame = encode_frame(&msg.payload);
        if let Err(e) = stream.write_all(&frame) {
            log::warn!(
                "[broker] conn {}: write failed, dropping message for '{}': {e}",
                conn.id(),
                msg.client_id
            );
            break;
        }
    }

    // Writer exit is fatal to the connection; make the reader notice now
    // instead of at its next read timeout.
    conn.alive.store(false, Ordering::SeqCst);
    let _ = conn.stream.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn(id: u64) -> (Arc<ClientConn>, UnixStream) {
        let (local, peer) = UnixStream::pair().unwrap();
        (Arc::new(ClientConn::new(id, local)), peer)
    }

    fn msg(payload: &[u8]) -> Message {
        Message {
            client_id: "test".to_string(),
            payload: payload.to_vec(),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_new_connection_is_alive_and_unbound() {
        let (conn, _peer) = test_conn(7);
        assert_eq!(conn.id(), 7);
        assert!(conn.is_alive());
        assert!(conn.bound_id().is_none());
    }

    #[test]
    fn test_enqueue_preserves_fifo_order() {
        let (conn, _peer) = test_conn(1);
        assert!(conn.enqueue(msg(b"first")));
        assert!(conn.enqueue(msg(b"second")));

        let mut outbox = conn.outbox.lock().unwrap();
        assert_eq!(outbox.pop_front().unwrap().payload, b"first");
        assert_eq!(outbox.pop_front().unwrap().payload, b"second");
    }

    #[test]
    fn test_enqueue_rejected_after_close() {
        let shared = BrokerShared::new(crate::config::BrokerConfig::at_path(
            "/tmp/pipehub-test-unused.sock",
        ));
        let (conn, _peer) = test_conn(1);

        conn.close(&shared);
        assert!(!conn.is_alive());
        assert!(!conn.enqueue(msg(b"late")));
        assert!(conn.outbox.lock().unwrap().is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let shared = BrokerShared::new(crate::config::BrokerConfig::at_path(
            "/tmp/pipehub-test-unused.sock",
        ));
        let (conn, _peer) = test_conn(1);

        conn.close(&shared);
        conn.close(&shared);
        assert!(!conn.is_alive());
    }
}
