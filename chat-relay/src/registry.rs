use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

use crate::{error::HubError, message::Message};

/// Opaque identifier handed out when a connection is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One live client link as seen by the hub.
///
/// Clones share the outbound queue and the liveness flag, so a snapshot taken
/// before a disconnect observes the connection going dead.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    identity: String,
    outbound: mpsc::Sender<Message>,
    alive: Arc<AtomicBool>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn outbound(&self) -> &mpsc::Sender<Message> {
        &self.outbound
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// Authoritative set of live connections.
///
/// The map lives behind a single tokio mutex that is only held for the map
/// operation itself. Tokio's mutex hands out the lock in FIFO order, so
/// snapshots and mutations cannot starve each other.
pub struct ConnectionRegistry {
    connections: Mutex<BTreeMap<ConnectionId, Connection>>,
    next_id: AtomicU64,
    max_connections: Option<usize>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_capacity_limit(None)
    }

    /// Creates a registry that refuses registrations beyond `max_connections`.
    pub fn with_capacity_limit(max_connections: Option<usize>) -> Self {
        Self {
            connections: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            max_connections,
        }
    }

    pub async fn register(
        &self,
        identity: String,
        outbound: mpsc::Sender<Message>,
    ) -> Result<ConnectionId, HubError> {
        let mut connections = self.connections.lock().await;

        if let Some(limit) = self.max_connections {
            if connections.len() >= limit {
                return Err(HubError::CapacityExceeded { limit });
            }
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        connections.insert(
            id,
            Connection {
                id,
                identity,
                outbound,
                alive: Arc::new(AtomicBool::new(true)),
            },
        );
        Ok(id)
    }

    /// Removes a connection. Unknown ids are ignored because disconnect
    /// notifications can race with cleanup.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.lock().await.remove(&id);
        if let Some(connection) = &removed {
            connection.mark_dead();
        }
        removed
    }

    /// Point-in-time copy of every live connection, in registration order.
    pub async fn snapshot(&self) -> Vec<Connection> {
        self.connections.lock().await.values().cloned().collect()
    }

    pub async fn identity_of(&self, id: ConnectionId) -> Result<String, HubError> {
        self.connections
            .lock()
            .await
            .get(&id)
            .map(|connection| connection.identity.clone())
            .ok_or(HubError::ConnectionNotFound(id))
    }

    /// The configured connection limit, if any.
    pub fn capacity(&self) -> Option<usize> {
        self.max_connections
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
