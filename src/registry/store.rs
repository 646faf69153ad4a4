//! Connection registry
//!
//! Authoritative bookkeeping of live connections. Reads (`lookup`,
//! `enumerate`, `enqueue`, `touch`) share the lock; lifecycle transitions
//! take it exclusively, so no caller ever observes a half-updated entry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::connection::{
    CloseReason, Connection, ConnectionId, ConnectionInfo, ConnectionState, OutboundReceiver,
};
use crate::config::RelayConfig;
use crate::message::{Message, Payload};

/// Errors that can occur during registry operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Connection identities exhausted")]
    RegistryExhausted,

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("Connection {0} sent too many messages before its handshake completed")]
    PrematureMessage(ConnectionId),

    #[error("Outbound queue full for connection {0}")]
    BackpressureExceeded(ConnectionId),

    #[error("Connection {0} is already open")]
    AlreadyOpen(ConnectionId),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Point-in-time copy of the tracked identities
///
/// Iterating it any number of times yields the same sequence; later
/// admissions and removals are not reflected.
#[derive(Debug, Clone)]
pub struct Snapshot {
    ids: Arc<[ConnectionId]>,
}

impl Snapshot {
    pub fn iter(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.ids.contains(&id)
    }
}

struct Inner {
    connections: BTreeMap<ConnectionId, Connection>,
    next_id: u64,
}

/// Tracks every connection that is `Connecting`, `Open` or `Closing`
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    max_outbound_queue: usize,
    max_premature: usize,
}

impl ConnectionRegistry {
    /// Create a registry sized from the relay configuration
    pub fn new(config: &RelayConfig) -> Self {
        Self::with_limits(
            config.max_outbound_queue_per_connection,
            config.max_premature_messages,
        )
    }

    /// Create a registry with explicit queue limits
    pub fn with_limits(max_outbound_queue: usize, max_premature: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                connections: BTreeMap::new(),
                next_id: 1,
            }),
            max_outbound_queue: max_outbound_queue.max(1),
            max_premature,
        }
    }

    #[cfg(test)]
    fn starting_at(mut self, next_id: u64) -> Self {
        self.inner.get_mut().next_id = next_id;
        self
    }

    /// Number of tracked connections
    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.connections.is_empty()
    }

    /// Register a new connection in `Connecting` state
    ///
    /// Returns the new identity and the receiving half of its outbound
    /// queue, which the transport drains to the socket.
    pub async fn admit(&self) -> RegistryResult<(ConnectionId, OutboundReceiver)> {
        let mut inner = self.inner.write().await;

        let raw = inner.next_id;
        let next = raw.checked_add(1).ok_or(RegistryError::RegistryExhausted)?;
        let id = ConnectionId::new(raw);
        if inner.connections.contains_key(&id) {
            return Err(RegistryError::RegistryExhausted);
        }
        inner.next_id = next;

        let (connection, rx) = Connection::new(id, self.max_outbound_queue);
        inner.connections.insert(id, connection);

        debug!("Admitted connection {} ({} tracked)", id, inner.connections.len());
        Ok((id, rx))
    }

    /// Transition `Connecting → Open`
    ///
    /// Returns messages buffered during the handshake, in arrival order.
    /// Opening an already-open connection is a no-op.
    pub async fn mark_open(&self, id: ConnectionId) -> RegistryResult<Vec<Message>> {
        let mut inner = self.inner.write().await;
        let connection = inner
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        match connection.state() {
            ConnectionState::Connecting => {
                let buffered = connection.set_open();
                info!("Connection {} open", id);
                Ok(buffered)
            }
            ConnectionState::Open => Ok(Vec::new()),
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(RegistryError::ConnectionClosed(id))
            }
        }
    }

    /// Resolve an identity to a snapshot of its connection
    pub async fn lookup(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let inner = self.inner.read().await;
        inner.connections.get(&id).map(Connection::info)
    }

    /// Copy of the tracked identities, in admission order
    pub async fn enumerate(&self) -> Snapshot {
        let inner = self.inner.read().await;
        Snapshot {
            ids: inner.connections.keys().copied().collect(),
        }
    }

    /// Transition to `Closing`
    ///
    /// Stops new deliveries and ends the outbound queue once its pending
    /// messages are flushed. Absent or already-closing connections are left
    /// alone. Returns whether a transition happened.
    pub async fn begin_close(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let mut inner = self.inner.write().await;
        match inner.connections.get_mut(&id) {
            Some(connection) => {
                let transitioned = connection.set_closing(reason);
                if transitioned {
                    info!("Connection {} closing: {}", id, reason);
                }
                transitioned
            }
            None => false,
        }
    }

    /// Transition to `Closed` and drop the entry
    ///
    /// Call only after the outbound queue has been flushed or discarded.
    pub async fn finalize_close(&self, id: ConnectionId) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        let mut connection = inner
            .connections
            .remove(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        if connection.state() != ConnectionState::Closing {
            warn!(
                "Connection {} finalized from {:?} without closing first",
                id,
                connection.state()
            );
        }
        connection.set_closed();

        info!("Connection {} closed ({} tracked)", id, inner.connections.len());
        Ok(())
    }

    /// Hold a message from a connection that is still handshaking
    pub async fn buffer_premature(
        &self,
        id: ConnectionId,
        message: Message,
    ) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        let connection = inner
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        connection.buffer(message, self.max_premature)
    }

    /// Append a payload to an open connection's outbound queue
    pub async fn enqueue(&self, id: ConnectionId, payload: Payload) -> RegistryResult<()> {
        let inner = self.inner.read().await;
        let connection = inner
            .connections
            .get(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        connection.enqueue(payload)
    }

    /// Record inbound activity. Returns false if the connection is unknown.
    pub async fn touch(&self, id: ConnectionId) -> bool {
        let inner = self.inner.read().await;
        match inner.connections.get(&id) {
            Some(connection) => {
                connection.touch();
                true
            }
            None => false,
        }
    }

    /// Connections that are not yet closing and have been silent longer
    /// than `idle_timeout`
    pub async fn idle_connections(&self, idle_timeout: Duration) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .connections
            .values()
            .filter(|c| {
                matches!(
                    c.state(),
                    ConnectionState::Connecting | ConnectionState::Open
                )
            })
            .filter(|c| c.idle() > idle_timeout)
            .map(Connection::id)
            .collect()
    }

    /// Move every connection to `Closing`. Returns how many transitioned.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let mut inner = self.inner.write().await;
        let mut closed = 0;
        for connection in inner.connections.values_mut() {
            if connection.set_closing(reason) {
                closed += 1;
            }
        }
        if closed > 0 {
            info!("Closing {} connections: {}", closed, reason);
        }
        closed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(&RelayConfig::default())
    }
}
