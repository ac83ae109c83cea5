use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::{ConnectionHandle, ConnectionId};

/// Thread-safe mapping of connection id to handle.
///
/// Entries are added only by the accept loop. By default disposed handles
/// stay registered for the lifetime of the server, reproducing the original
/// design's known limitation; `relay.remove_on_disconnect` opts into
/// removal when a connection ends.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<ConnectionHandle>) {
        let id = handle.id;
        self.connections.insert(id, handle);
        tracing::debug!(connection_id = %id, total = self.connections.len(), "Connection registered");
    }

    /// Snapshot of all registered handles. Concurrent inserts may or may
    /// not be included; callers must not rely on ordering.
    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.connections.remove(&id).map(|(_, h)| h);
        if removed.is_some() {
            tracing::debug!(connection_id = %id, "Connection removed from registry");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut disposed = 0;
        for entry in self.connections.iter() {
            if entry.value().is_disposed() {
                disposed += 1;
            }
        }
        RegistryStats {
            registered: self.connections.len(),
            disposed,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    /// Every handle ever registered and not explicitly removed.
    pub registered: usize,
    /// Registered handles that have already been disposed.
    pub disposed: usize,
}
