use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::network::Connection;
use crate::{AppError, AppResult};

/// Tracks active connections by id and enforces the connection ceiling.
///
/// `remove` is idempotent: it is invoked from the close path, which can race
/// with an explicit shutdown sweep, and must never double-count a slot.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<u64, Arc<Connection>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> ConnectionRegistry {
        ConnectionRegistry {
            connections: DashMap::with_capacity(max_connections),
            max_connections,
        }
    }

    pub fn add(&self, connection: Arc<Connection>) -> AppResult<()> {
        if self.connections.len() >= self.max_connections {
            return Err(AppError::CapacityExceeded(format!(
                "connection registry is full ({} active)",
                self.max_connections
            )));
        }
        match self.connections.entry(connection.id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(AppError::DuplicateConnectionId(connection.id()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(connection);
                Ok(())
            }
        }
    }

    /// Removes a connection. Safe to call again for an id already removed.
    pub fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(&id).map(|(_, conn)| conn);
        if removed.is_some() {
            debug!("connection {} removed from registry", id);
        }
        removed
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Whether some active connection already belongs to `peer_ip`.
    ///
    /// Ports are ignored: a reconnecting server peer arrives from an
    /// ephemeral port, so the address alone identifies the peer host.
    pub fn has_duplicate_peer(&self, peer_ip: IpAddr) -> bool {
        self.connections
            .iter()
            .any(|entry| entry.value().remote_addr().ip() == peer_ip)
    }

    /// Whether an active connection targets exactly `endpoint`, used to
    /// suppress a second outbound connect to the same remote.
    pub fn has_endpoint(&self, endpoint: &SocketAddr) -> bool {
        self.connections
            .iter()
            .any(|entry| entry.value().remote_addr() == *endpoint)
    }

    /// Snapshot of the active connections, for shutdown sweeps and stats.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
