//! Local message broker over a Unix domain socket.
//!
//! Accepts any number of concurrent client connections, binds each one to
//! an application-supplied client identifier via a one-time handshake
//! frame, and relays opaque length-prefixed payloads between the host
//! application and its clients.
//!
//! # Architecture
//!
//! ```text
//! client ──handshake──►┌──────────────────────────────┐
//! client ──frames─────►│  PipeBroker                  │──► inbox ──► host
//! client ◄──frames─────│   ├─ broker-accept thread    │
//!                      │   ├─ registry (id → conn)    │◄── send_to_client
//!                      │   └─ conn-read/-write pair   │◄── broadcast
//!                      └──────────────────────────────┘
//! ```
//!
//! Received messages land in a single shared inbox, drained with
//! [`PipeBroker::try_pop_received`] or the blocking
//! [`PipeBroker::wait_and_pop_received`]; a registered handler additionally
//! sees each message synchronously on the receiving connection's read
//! worker. Outbound delivery is at-most-once: a connection that dies
//! mid-write silently drops the in-flight message.
//!
//! The broker is a plain value. Construct as many as needed, each with its
//! own socket path; `start`/`stop` are idempotent and `stop` is safe from
//! any thread, including a ctrl-c handler.

// Rust guideline compliant 2026-02

pub(crate) mod connection;
mod inbox;
mod registry;


use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use connection::{spawn_workers, ClientConn};
use inbox::Inbox;
use registry::Registry;

use crate::config::BrokerConfig;

/// Upper bound (exclusive) on the byte length of a handshake identifier.
pub const MAX_CLIENT_ID_BYTES: usize = 256;

/// Conservative `sun_path` limit (104 bytes on macOS, 108 on Linux).
const MAX_SOCKET_PATH: usize = 104;

/// Backoff after an accept error before retrying.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Milliseconds since the Unix epoch.
///
/// Stamped onto every message at enqueue time, both inbound and outbound.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─── Message ───────────────────────────────────────────────────────────────

/// One delivered unit: an identifier-tagged payload.
///
/// For inbound messages `client_id` names the sender; for outbound
/// messages it names the recipient. The payload is opaque bytes in both
/// directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Client identifier this message is from (inbound) or for (outbound).
    pub client_id: String,
    /// Raw frame payload.
    pub payload: Vec<u8>,
    /// Broker-assigned wall-clock timestamp, milliseconds UTC.
    pub timestamp_ms: u64,
}

/// Callback invoked synchronously for every message received from a bound
/// client. Runs on that connection's read worker: a slow handler degrades
/// only that one connection, a panicking handler closes it.
pub type MessageHandler = dyn Fn(&Message) + Send + Sync;

// ─── Shared state ──────────────────────────────────────────────────────────

/// State shared between the broker handle, the acceptor, and every
/// connection worker.
pub(crate) struct BrokerShared {
    pub(crate) config: BrokerConfig,
    running: AtomicBool,
    pub(crate) registry: Registry,
    pub(crate) inbox: Inbox,
    pub(crate) handler: Mutex<Option<Arc<MessageHandler>>>,
    /// Every live connection by broker-unique id, bound or not. Stop
    /// closes these; the registry only knows about bound ones.
    pub(crate) connections: Mutex<HashMap<u64, Arc<ClientConn>>>,
    next_conn_id: AtomicU64,
}

impl BrokerShared {
    pub(crate) fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            running: AtomicBool::new(false),
            registry: Registry::new(),
            inbox: Inbox::new(),
            handler: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ─── PipeBroker ────────────────────────────────────────────────────────────

/// The message broker: acceptor, registry, and inbox behind one handle.
pub struct PipeBroker {
    shared: Arc<BrokerShared>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PipeBroker {
    /// Create a stopped broker for the given configuration.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            shared: Arc::new(BrokerShared::new(config)),
            accept_handle: Mutex::new(None),
        }
    }

    /// Bind the socket and launch the acceptor thread.
    ///
    /// Idempotent: `Ok(true)` when this call started the broker, `Ok(false)`
    /// when it was already running. Returns as soon as the listener is up;
    /// connections are handled on their own threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket path is over-long, a stale socket
    /// file cannot be removed, or the listener cannot be bound. The broker
    /// is left stopped in every error case.
    pub fn start(&self) -> Result<bool> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let listener = match bind_listener(&self.shared.config) {
            Ok(listener) => listener,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        // A restarted broker accepts messages again.
        self.shared.inbox.reopen();

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("broker-accept".to_string())
            .spawn(move || accept_loop(&listener, &shared));

        match spawned {
            Ok(handle) => {
                *self
                    .accept_handle
                    .lock()
                    .expect("accept_handle mutex poisoned") = Some(handle);
                log::info!(
                    "[broker] listening on {}",
                    self.shared.config.socket_path.display()
                );
                Ok(true)
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                let _ = std::fs::remove_file(&self.shared.config.socket_path);
                Err(e).context("spawn acceptor thread")
            }
        }
    }

    /// Stop the broker: join the acceptor, close every live connection,
    /// wake all inbox waiters, and remove the socket file.
    ///
    /// Idempotent and safe from any thread. Messages already received stay
    /// in the inbox and remain poppable after this returns.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("[broker] stopping");

        let handle = self
            .accept_handle
            .lock()
            .expect("accept_handle mutex poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        // Snapshot first: workers remove themselves from the table as they
        // close, which would otherwise deadlock against this iteration.
        let conns: Vec<Arc<ClientConn>> = {
            let table = self
                .shared
                .connections
                .lock()
                .expect("connections mutex poisoned");
            table.values().map(Arc::clone).collect()
        };
        for conn in conns {
            conn.close(&self.shared);
        }

        self.shared.inbox.close();

        let _ = std::fs::remove_file(&self.shared.config.socket_path);
        log::info!("[broker] stopped");
    }

    /// Whether the broker is currently accepting connections.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// The socket path this broker listens on.
    pub fn socket_path(&self) -> &Path {
        &self.shared.config.socket_path
    }

    // ── Sending ────────────────────────────────────────────────────────

    /// Queue `payload` for the client bound as `client_id`.
    ///
    /// Returns `false` if no such client is bound or its connection is
    /// already closed. Unknown recipients are routine, not an error. Never
    /// blocks on I/O; actual delivery is asynchronous and best-effort.
    pub fn send_to_client(&self, client_id: &str, payload: &[u8]) -> bool {
        let Some(conn) = self.shared.registry.lookup(client_id) else {
            return false;
        };
        conn.enqueue(Message {
            client_id: client_id.to_string(),
            payload: payload.to_vec(),
            timestamp_ms: now_ms(),
        })
    }

    /// Serialize `value` as JSON and send it to one client.
    pub fn send_json_to_client(&self, client_id: &str, value: &serde_json::Value) -> bool {
        let payload = serde_json::to_vec(value).expect("JSON serialization cannot fail");
        self.send_to_client(client_id, &payload)
    }

    /// Queue `payload` for every bound client.
    ///
    /// Returns the number of clients the enqueue was attempted for, not
    /// the number that will actually receive it. Each client gets its own
    /// timestamp.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let mut attempted = 0;
        for (client_id, conn) in self.shared.registry.snapshot() {
            let queued = conn.enqueue(Message {
                client_id,
                payload: payload.to_vec(),
                timestamp_ms: now_ms(),
            });
            if queued {
                attempted += 1;
            }
        }
        attempted
    }

    /// Serialize `value` as JSON and broadcast it.
    pub fn broadcast_json(&self, value: &serde_json::Value) -> usize {
        let payload = serde_json::to_vec(value).expect("JSON serialization cannot fail");
        self.broadcast(&payload)
    }

    // ── Receiving ──────────────────────────────────────────────────────

    /// Pop the oldest received message without blocking.
    pub fn try_pop_received(&self) -> Option<Message> {
        self.shared.inbox.try_pop()
    }

    /// Block until a message is received or the broker stops.
    ///
    /// Returns `None` only on shutdown with an empty inbox; messages
    /// received before `stop` are still returned afterwards. Never hangs
    /// past shutdown, even when called after `stop`.
    pub fn wait_and_pop_received(&self) -> Option<Message> {
        self.shared.inbox.wait_pop()
    }

    /// Register a handler called synchronously for every received message,
    /// in addition to (not instead of) inbox delivery.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let mut guard = self.shared.handler.lock().expect("handler mutex poisoned");
        *guard = Some(Arc::new(handler));
    }

    /// Remove the registered message handler, if any.
    pub fn clear_message_handler(&self) {
        let mut guard = self.shared.handler.lock().expect("handler mutex poisoned");
        *guard = None;
    }

    // ── Clients ────────────────────────────────────────────────────────

    /// Snapshot of currently bound client identifiers.
    pub fn list_clients(&self) -> Vec<String> {
        self.shared.registry.keys()
    }

    /// Number of currently bound clients.
    pub fn client_count(&self) -> usize {
        self.shared.registry.count()
    }

    /// Forcibly close the connection bound as `client_id`.
    ///
    /// Returns `false` if no such client is bound.
    pub fn disconnect_client(&self, client_id: &str) -> bool {
        let Some(conn) = self.shared.registry.lookup(client_id) else {
            return false;
        };
        log::info!("[broker] disconnecting client '{client_id}'");
        conn.close(&self.shared);
        true
    }
}

impl Drop for PipeBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for PipeBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeBroker")
            .field("socket_path", &self.shared.config.socket_path)
            .field("running", &self.is_running())
            .field("clients", &self.shared.registry.count())
            .finish()
    }
}

// ─── Listener & acceptor ───────────────────────────────────────────────────

/// Bind the broker's listening socket.
///
/// Removes any stale socket file, creates the parent directory, binds,
/// restricts the socket file to owner-only, and switches the listener to
/// non-blocking so the acceptor can observe the running flag between
/// accept attempts.
fn bind_listener(config: &BrokerConfig) -> Result<UnixListener> {
    let socket_path = &config.socket_path;

    let path_len = socket_path.as_os_str().len();
    if path_len >= MAX_SOCKET_PATH {
        anyhow::bail!(
            "Socket path too long ({path_len} bytes, max {}): {}",
            MAX_SOCKET_PATH - 1,
            socket_path.display()
        );
    }

    // Remove stale socket file if it exists
    if socket_path.exists() {
        std::fs::remove_file(socket_path).with_context(|| {
            format!("Failed to remove stale socket: {}", socket_path.display())
        })?;
    }

    // Ensure parent directory exists
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;

    // Set socket permissions to owner-only (0600)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(socket_path, perms)?;
    }

    listener.set_nonblocking(true)?;

    Ok(listener)
}

/// Accept loop, one iteration per pending connection or poll slice.
///
/// Runs until the broker stops. Accept errors are logged and retried
/// after a short backoff; they never terminate the loop.
fn accept_loop(listener: &UnixListener, shared: &Arc<BrokerShared>) {
    while shared.is_running() {
        match listener.accept() {
            Ok((stream, _addr)) => setup_connection(stream, shared),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_RETRY);
            }
            Err(e) => {
                log::error!("[broker] accept error: {e}");
                thread::sleep(ACCEPT_RETRY);
            }
        }
    }
}

/// Register an accepted stream and hand it to its worker pair.
fn setup_connection(stream: UnixStream, shared: &Arc<BrokerShared>) {
    let io_timeout = shared.config.io_timeout;
    // The listener is non-blocking; its accepted sockets must not be.
    // Bounded I/O timeouts keep the workers responsive to shutdown.
    let configured = stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_read_timeout(Some(io_timeout)))
        .and_then(|()| stream.set_write_timeout(Some(io_timeout)));
    if let Err(e) = configured {
        log::error!("[broker] configure accepted socket: {e}");
        return;
    }

    let conn_id = shared.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let conn = Arc::new(ClientConn::new(conn_id, stream));
    shared
        .connections
        .lock()
        .expect("connections mutex poisoned")
        .insert(conn_id, Arc::clone(&conn));

    log::info!("[broker] conn {conn_id} accepted, awaiting handshake");
    spawn_workers(conn, Arc::clone(shared));
}
