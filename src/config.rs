//! Broker runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Tunable parameters for a [`PipeBroker`](crate::broker::PipeBroker).
///
/// Most callers only override `socket_path`; the remaining knobs exist for
/// tests and for embedding the broker in hosts with unusual I/O patterns.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Filesystem path of the Unix domain socket to listen on.
    pub socket_path: PathBuf,
    /// Per-connection read buffer size in bytes.
    pub read_buffer_size: usize,
    /// Read/write timeout applied to each accepted connection.
    ///
    /// Worker threads never block on a socket longer than this, so they
    /// observe shutdown flags promptly even against a silent peer.
    pub io_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            read_buffer_size: 8192,
            io_timeout: Duration::from_secs(5),
        }
    }
}

impl BrokerConfig {
    /// Config listening on `socket_path` with default buffer and timeouts.
    pub fn at_path(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }
}

/// Default broker socket path for the current user.
///
/// Format: `/tmp/pipehub-{uid}/broker.sock`. Scoping by uid keeps brokers
/// of different users from clobbering each other's sockets while staying
/// well under the 104-byte kernel limit on socket paths.
pub fn default_socket_path() -> PathBuf {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/pipehub-{uid}/broker.sock"))
}
