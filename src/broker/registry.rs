//! Client identifier registry.
//!
//! Maps each bound client id to the connection that most recently claimed
//! it. Binding is last-wins: a new connection claiming an in-use id simply
//! replaces the entry, and the superseded connection keeps running unbound
//! until its peer hangs up. Removal is conditional on connection identity
//! so a stale worker can never evict its successor.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::broker::connection::ClientConn;

/// Shared id → connection map. All methods take `&self`; locking is
/// internal and never held across I/O.
pub(crate) struct Registry {
    clients: Mutex<HashMap<String, Arc<ClientConn>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `client_id` to `conn`, replacing any previous binding.
    pub(crate) fn bind(&self, client_id: &str, conn: &Arc<ClientConn>) {
        let mut clients = self.clients.lock().expect("registry mutex poisoned");
        let previous = clients.insert(client_id.to_string(), Arc::clone(conn));
        drop(clients);

        if let Some(prev) = previous {
            if prev.id() != conn.id() {
                log::warn!(
                    "[broker] client id '{client_id}' re-bound: conn {} supersedes conn {}",
                    conn.id(),
                    prev.id()
                );
            }
        }
    }

    /// Connection currently bound to `client_id`, if any.
    pub(crate) fn lookup(&self, client_id: &str) -> Option<Arc<ClientConn>> {
        let clients = self.clients.lock().expect("registry mutex poisoned");
        clients.get(client_id).map(Arc::clone)
    }

    /// Remove the binding for `client_id`, but only if it still points at
    /// connection `conn_id`. Returns whether an entry was removed.
    pub(crate) fn remove_if(&self, client_id: &str, conn_id: u64) -> bool {
        let mut clients = self.clients.lock().expect("registry mutex poisoned");
        match clients.get(client_id) {
            Some(current) if current.id() == conn_id => {
                clients.remove(client_id);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of all bound client ids.
    pub(crate) fn keys(&self) -> Vec<String> {
        let clients = self.clients.lock().expect("registry mutex poisoned");
        clients.keys().cloned().collect()
    }

    /// Number of bound clients.
    pub(crate) fn count(&self) -> usize {
        let clients = self.clients.lock().expect("registry mutex poisoned");
        clients.len()
    }

    /// Snapshot of all bindings, for iteration without the lock held.
    pub(crate) fn snapshot(&self) -> Vec<(String, Arc<ClientConn>)> {
        let clients = self.clients.lock().expect("registry mutex poisoned");
        clients
            .iter()
            .map(|(id, conn)| (id.clone(), Arc::clone(conn)))
            .collect()
    }
}
