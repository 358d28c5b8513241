//! Registry of live connections.
//!
//! Connections live in a slab arena keyed by a stable [`Handle`] from the
//! moment they are accepted until they disconnect. A secondary index maps
//! the identifiers connections pick for themselves onto those handles, which
//! is what unicast resolves through.
//!
//! A single `RwLock` guards both: attach, rename and detach take it for
//! writing, lookup and broadcast take it for reading. Every broadcast
//! therefore sees one consistent snapshot of the connection set.

use crate::runtime::interface::ConnectionInterface;
use parking_lot::RwLock;
use serde::Deserialize;
use slab::Slab;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Stable key of a connection in the registry arena.
pub type Handle = usize;

/// Whether a broadcast is also delivered back to its sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BroadcastPolicy {
    #[default]
    ExcludeSender,
    IncludeSender,
}

/// Registry failures. Connections report these through the log sink.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry is at capacity ({0} connections)")]
    Full(usize),
    #[error("identifier '{0}' is already registered")]
    IdTaken(String),
    #[error("connection {0} is not attached")]
    Detached(Handle),
    #[error("connection is already attached as {0}")]
    AlreadyAttached(Handle),
    #[error("registry has shut down")]
    Gone,
}

/// Destination for diagnostics emitted by tasks through `log`.
pub trait LogSink: Send + Sync {
    fn log(&self, handle: Option<Handle>, id: Option<&str>, message: &[u8]);
}

/// Default sink: one `tracing` event per message.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, handle: Option<Handle>, id: Option<&str>, message: &[u8]) {
        info!(
            target: "switchboard::task",
            conn = ?handle,
            id = id.unwrap_or("-"),
            "{}",
            String::from_utf8_lossy(message).trim_end()
        );
    }
}

struct Entry {
    conn: Arc<dyn ConnectionInterface>,
    id: Option<String>,
}

struct Inner {
    connections: Slab<Entry>,
    by_id: HashMap<String, Handle>,
}

/// Set of active connections, addressable by handle and by identifier.
pub struct Registry {
    inner: RwLock<Inner>,
    max_connections: usize,
    policy: BroadcastPolicy,
    sink: Box<dyn LogSink>,
}

impl Registry {
    /// Create a registry that logs through `tracing`.
    pub fn new(max_connections: usize, policy: BroadcastPolicy) -> Arc<Self> {
        Self::with_sink(max_connections, policy, Box::new(TracingSink))
    }

    /// Create a registry with a custom log sink.
    pub fn with_sink(
        max_connections: usize,
        policy: BroadcastPolicy,
        sink: Box<dyn LogSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner {
                connections: Slab::with_capacity(max_connections),
                by_id: HashMap::new(),
            }),
            max_connections,
            policy,
            sink,
        })
    }

    /// Insert a new, still anonymous connection.
    pub fn attach(&self, conn: Arc<dyn ConnectionInterface>) -> Result<Handle, RegistryError> {
        let mut inner = self.inner.write();
        if inner.connections.len() >= self.max_connections {
            return Err(RegistryError::Full(self.max_connections));
        }
        Ok(inner.connections.insert(Entry { conn, id: None }))
    }

    /// Name an attached connection. Renaming releases the previous name.
    pub fn register(&self, id: &str, handle: Handle) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let Inner {
            connections,
            by_id,
        } = &mut *inner;

        match by_id.get(id) {
            Some(&owner) if owner == handle => return Ok(()),
            Some(_) => return Err(RegistryError::IdTaken(id.to_owned())),
            None => {}
        }

        let entry = connections
            .get_mut(handle)
            .ok_or(RegistryError::Detached(handle))?;
        if let Some(previous) = entry.id.replace(id.to_owned()) {
            by_id.remove(&previous);
        }
        by_id.insert(id.to_owned(), handle);

        debug!(conn = handle, id, "Registered connection");
        Ok(())
    }

    /// Remove a connection. After this returns no lookup or broadcast
    /// reaches it.
    pub fn unregister(&self, handle: Handle) -> Option<Arc<dyn ConnectionInterface>> {
        let mut inner = self.inner.write();
        let entry = inner.connections.try_remove(handle)?;
        if let Some(id) = &entry.id {
            inner.by_id.remove(id);
        }
        debug!(conn = handle, id = ?entry.id, "Unregistered connection");
        Some(entry.conn)
    }

    /// Resolve an identifier.
    pub fn lookup(&self, id: &str) -> Option<Arc<dyn ConnectionInterface>> {
        let inner = self.inner.read();
        let handle = *inner.by_id.get(id)?;
        inner.connections.get(handle).map(|entry| Arc::clone(&entry.conn))
    }

    /// Visit every attached connection.
    ///
    /// Runs over a snapshot taken under the lock, so `f` may call back into
    /// the registry.
    pub fn for_each(&self, mut f: impl FnMut(Handle, &dyn ConnectionInterface)) {
        let snapshot: Vec<(Handle, Arc<dyn ConnectionInterface>)> = {
            let inner = self.inner.read();
            inner
                .connections
                .iter()
                .map(|(handle, entry)| (handle, Arc::clone(&entry.conn)))
                .collect()
        };
        for (handle, conn) in snapshot {
            f(handle, conn.as_ref());
        }
    }

    /// Queue `message` on every attached connection, honouring the
    /// broadcast policy for `from`. Returns the number of recipients.
    ///
    /// Delivery happens under the read lock. `response` only queues bytes
    /// and never re-enters the registry.
    pub fn broadcast(&self, from: Option<Handle>, message: &[u8]) -> usize {
        let inner = self.inner.read();
        let mut delivered = 0;
        for (handle, entry) in inner.connections.iter() {
            if self.policy == BroadcastPolicy::ExcludeSender && Some(handle) == from {
                continue;
            }
            entry.conn.response(message);
            delivered += 1;
        }
        delivered
    }

    /// Task log sink.
    pub fn log(&self, handle: Option<Handle>, id: Option<&str>, message: &[u8]) {
        self.sink.log(handle, id, message);
    }

    /// Number of attached connections.
    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.inner.read().connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().by_id.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{CountingSink, StubConn};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn attach(registry: &Registry) -> (Arc<StubConn>, Handle) {
        let conn = StubConn::new();
        let handle = registry.attach(conn.clone()).unwrap();
        conn.set_handle(handle);
        (conn, handle)
    }

    #[test]
    fn test_attach_respects_capacity() {
        let registry = Registry::new(2, BroadcastPolicy::ExcludeSender);
        attach(&registry);
        attach(&registry);

        assert_eq!(
            registry.attach(StubConn::new()).unwrap_err(),
            RegistryError::Full(2)
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), 2);
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new(8, BroadcastPolicy::ExcludeSender);
        let (alice, h1) = attach(&registry);
        let (_bob, h2) = attach(&registry);

        registry.register("alice", h1).unwrap();
        assert_eq!(
            registry.register("alice", h2).unwrap_err(),
            RegistryError::IdTaken("alice".into())
        );
        // Re-registering the same name on the same connection is fine
        registry.register("alice", h1).unwrap();

        let found = registry.lookup("alice").unwrap();
        assert_eq!(found.handle(), alice.handle());
        assert!(registry.lookup("carol").is_none());
    }

    #[test]
    fn test_rename_releases_old_id() {
        let registry = Registry::new(8, BroadcastPolicy::ExcludeSender);
        let (_conn, handle) = attach(&registry);

        registry.register("alice", handle).unwrap();
        registry.register("alicia", handle).unwrap();

        assert!(registry.lookup("alice").is_none());
        assert!(registry.lookup("alicia").is_some());
        assert_eq!(registry.ids(), vec!["alicia".to_string()]);
    }

    #[test]
    fn test_register_detached_handle() {
        let registry = Registry::new(8, BroadcastPolicy::ExcludeSender);
        assert_eq!(
            registry.register("ghost", 7).unwrap_err(),
            RegistryError::Detached(7)
        );
    }

    #[test]
    fn test_unregister_removes_id() {
        let registry = Registry::new(8, BroadcastPolicy::ExcludeSender);
        let (_conn, handle) = attach(&registry);
        registry.register("alice", handle).unwrap();

        assert!(registry.unregister(handle).is_some());
        assert!(registry.unregister(handle).is_none());
        assert!(registry.lookup("alice").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_broadcast_policy() {
        let registry = Registry::new(8, BroadcastPolicy::ExcludeSender);
        let (a, ha) = attach(&registry);
        let (b, _) = attach(&registry);
        let (c, _) = attach(&registry);

        assert_eq!(registry.broadcast(Some(ha), b"x"), 2);
        assert!(a.received().is_empty());
        assert_eq!(b.received(), vec![b"x".to_vec()]);
        assert_eq!(c.received(), vec![b"x".to_vec()]);

        let registry = Registry::new(8, BroadcastPolicy::IncludeSender);
        let (a, ha) = attach(&registry);
        let (b, _) = attach(&registry);
        assert_eq!(registry.broadcast(Some(ha), b"y"), 2);
        assert_eq!(a.received(), vec![b"y".to_vec()]);
        assert_eq!(b.received(), vec![b"y".to_vec()]);
    }

    #[test]
    fn test_broadcast_during_churn() {
        let registry = Registry::new(1024, BroadcastPolicy::ExcludeSender);
        let stable: Vec<_> = (0..3).map(|_| attach(&registry).0).collect();
        let done = Arc::new(AtomicBool::new(false));

        let churn = {
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut removed = Vec::new();
                while !done.load(Ordering::Relaxed) {
                    let (conn, handle) = attach(&registry);
                    registry.unregister(handle);
                    // Nothing may reach a connection after it is gone
                    removed.push((conn.received().len(), conn));
                }
                removed
            })
        };

        for i in 0..200u32 {
            registry.broadcast(None, &i.to_be_bytes());
        }
        done.store(true, Ordering::Relaxed);
        let removed = churn.join().unwrap();

        for conn in &stable {
            let received = conn.received();
            assert_eq!(received.len(), 200);
            for (i, message) in received.iter().enumerate() {
                assert_eq!(message.as_slice(), &(i as u32).to_be_bytes());
            }
        }
        for (seen_at_removal, conn) in removed {
            let received = conn.received();
            assert_eq!(received.len(), seen_at_removal);
            let mut unique = received.clone();
            unique.dedup();
            assert_eq!(unique.len(), received.len());
        }
    }

    #[test]
    fn test_for_each_may_reenter() {
        let registry = Registry::new(8, BroadcastPolicy::ExcludeSender);
        attach(&registry);
        attach(&registry);

        let mut seen = 0;
        registry.for_each(|handle, conn| {
            assert_eq!(conn.handle(), Some(handle));
            // Re-entrant call while iterating
            assert_eq!(registry.len(), 2);
            seen += 1;
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_log_goes_to_sink() {
        let sink = CountingSink::default();
        let lines = sink.lines();
        let registry = Registry::with_sink(8, BroadcastPolicy::ExcludeSender, Box::new(sink));

        registry.log(Some(3), Some("alice"), b"hello");
        assert_eq!(lines.lock().as_slice(), ["alice: hello".to_string()]);
    }
}
