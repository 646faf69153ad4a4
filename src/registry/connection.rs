//! Individual connection entry
//!
//! A `Connection` lives only inside the registry map. Everything outside the
//! registry sees a `ConnectionId` or a `ConnectionInfo` snapshot.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{RegistryError, RegistryResult};
use crate::message::{Message, Payload};

/// Receiving half of a connection's outbound queue, owned by the transport
///
/// Shares a pending counter with the registry entry so the backlog stays
/// visible while a closing connection drains.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::Receiver<Payload>,
    pending: Arc<AtomicUsize>,
}

impl OutboundReceiver {
    /// Next queued payload, or `None` once the queue has ended and is empty
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Payload> {
        let payload = self.rx.recv().await;
        if payload.is_some() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        payload
    }

    pub fn try_recv(&mut self) -> Result<Payload, mpsc::error::TryRecvError> {
        let payload = self.rx.try_recv()?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Ok(payload)
    }

    /// Stop accepting payloads; already queued ones can still be received
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Process-unique connection identity
///
/// Allocated from a monotonically increasing counter and never reused
/// while the process runs, so ordering by id is admission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(super) fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Transport accepted, handshake in progress
    Connecting,
    /// Handshake complete, traffic flows both ways
    Open,
    /// Shutting down; no new deliveries, queue is being flushed
    Closing,
    /// Gone; never observable in the registry
    Closed,
}

/// Why a connection left the `Open` state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client closed the connection
    PeerClosed,
    /// The server is shutting down
    Shutdown,
    /// No traffic within the idle timeout
    IdleTimeout,
    /// A handler exceeded its time budget
    HandlerTimeout,
    /// The socket failed
    TransportError,
    /// The outbound queue stayed full
    SlowConsumer,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::Shutdown => "server shutting down",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::HandlerTimeout => "handler timeout",
            CloseReason::TransportError => "transport error",
            CloseReason::SlowConsumer => "slow consumer",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a connection at the time of the lookup
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub created_at: Instant,
    /// Time since the last inbound activity
    pub idle: Duration,
    /// Messages waiting in the outbound queue
    pub queued: usize,
    pub close_reason: Option<CloseReason>,
}

impl ConnectionInfo {
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

/// Registry-owned connection record
pub(super) struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last inbound activity
    last_activity_ms: AtomicU64,
    /// Dropped when the connection starts closing so the writer sees the end
    outbound: Option<mpsc::Sender<Payload>>,
    /// Payloads enqueued but not yet taken by the writer
    pending: Arc<AtomicUsize>,
    premature: VecDeque<Message>,
    close_reason: Option<CloseReason>,
}

impl Connection {
    /// Create a connection in `Connecting` state with a queue of `capacity`
    pub(super) fn new(id: ConnectionId, capacity: usize) -> (Self, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let pending = Arc::new(AtomicUsize::new(0));
        let connection = Self {
            id,
            state: ConnectionState::Connecting,
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            outbound: Some(tx),
            pending: Arc::clone(&pending),
            premature: VecDeque::new(),
            close_reason: None,
        };
        (connection, OutboundReceiver { rx, pending })
    }

    pub(super) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(super) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(super) fn set_open(&mut self) -> Vec<Message> {
        self.state = ConnectionState::Open;
        self.premature.drain(..).collect()
    }

    /// Move to `Closing`. Returns false if already closing.
    pub(super) fn set_closing(&mut self, reason: CloseReason) -> bool {
        if self.state == ConnectionState::Closing {
            return false;
        }
        self.state = ConnectionState::Closing;
        self.close_reason = Some(reason);
        self.outbound = None;
        self.premature.clear();
        true
    }

    pub(super) fn set_closed(&mut self) {
        self.state = ConnectionState::Closed;
        self.outbound = None;
    }

    /// Record inbound activity
    pub(super) fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    pub(super) fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    pub(super) fn queued(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Buffer a message that arrived before the handshake finished
    pub(super) fn buffer(&mut self, message: Message, limit: usize) -> RegistryResult<()> {
        match self.state {
            ConnectionState::Connecting => {}
            ConnectionState::Open => return Err(RegistryError::AlreadyOpen(self.id)),
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(RegistryError::ConnectionClosed(self.id))
            }
        }
        if self.premature.len() >= limit {
            return Err(RegistryError::PrematureMessage(self.id));
        }
        self.premature.push_back(message);
        Ok(())
    }

    /// Append to the outbound queue without waiting
    pub(super) fn enqueue(&self, payload: Payload) -> RegistryResult<()> {
        if self.state != ConnectionState::Open {
            return Err(RegistryError::ConnectionClosed(self.id));
        }
        let tx = self
            .outbound
            .as_ref()
            .ok_or(RegistryError::ConnectionClosed(self.id))?;
        // Counted before the send so the writer never decrements first
        self.pending.fetch_add(1, Ordering::AcqRel);
        tx.try_send(payload).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            match e {
                mpsc::error::TrySendError::Full(_) => RegistryError::BackpressureExceeded(self.id),
                mpsc::error::TrySendError::Closed(_) => RegistryError::ConnectionClosed(self.id),
            }
        })
    }

    pub(super) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            state: self.state,
            created_at: self.created_at,
            idle: self.idle(),
            queued: self.queued(),
            close_reason: self.close_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(capacity: usize) -> (Connection, OutboundReceiver) {
        Connection::new(ConnectionId::new(1), capacity)
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
        assert_eq!(ConnectionId::new(7).as_u64(), 7);
    }

    #[test]
    fn test_new_connection_is_connecting() {
        let (conn, _rx) = make_connection(4);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        let info = conn.info();
        assert_eq!(info.queued, 0);
        assert!(info.close_reason.is_none());
        assert!(!info.is_open());
    }

    #[test]
    fn test_enqueue_requires_open() {
        let (mut conn, _rx) = make_connection(4);
        let result = conn.enqueue(Payload::text("early"));
        assert!(matches!(result, Err(RegistryError::ConnectionClosed(_))));

        conn.set_open();
        assert!(conn.enqueue(Payload::text("ok")).is_ok());
        assert_eq!(conn.queued(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_full_queue() {
        let (mut conn, mut rx) = make_connection(2);
        conn.set_open();
        assert!(conn.enqueue(Payload::text("1")).is_ok());
        assert!(conn.enqueue(Payload::text("2")).is_ok());

        let result = conn.enqueue(Payload::text("3"));
        assert!(matches!(result, Err(RegistryError::BackpressureExceeded(_))));

        // Draining one slot makes room again
        assert_eq!(rx.recv().await, Some(Payload::text("1")));
        assert!(conn.enqueue(Payload::text("3")).is_ok());
    }

    #[test]
    fn test_enqueue_after_receiver_dropped() {
        let (mut conn, rx) = make_connection(2);
        conn.set_open();
        drop(rx);
        let result = conn.enqueue(Payload::text("lost"));
        assert!(matches!(result, Err(RegistryError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_closing_ends_queue_after_flush() {
        let (mut conn, mut rx) = make_connection(4);
        conn.set_open();
        conn.enqueue(Payload::text("pending")).unwrap();

        assert!(conn.set_closing(CloseReason::Shutdown));
        assert!(!conn.set_closing(CloseReason::IdleTimeout));
        assert_eq!(conn.info().close_reason, Some(CloseReason::Shutdown));

        // Already queued messages are still flushed, then the queue ends
        assert_eq!(rx.recv().await, Some(Payload::text("pending")));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_queued_counts_backlog_while_closing() {
        let (mut conn, mut rx) = make_connection(4);
        conn.set_open();
        conn.enqueue(Payload::text("a")).unwrap();
        conn.enqueue(Payload::text("b")).unwrap();
        assert!(conn.enqueue(Payload::text("c")).is_ok());
        assert_eq!(conn.queued(), 3);

        conn.set_closing(CloseReason::IdleTimeout);
        assert_eq!(conn.info().queued, 3);

        rx.recv().await.unwrap();
        assert_eq!(conn.info().queued, 2);
        rx.close();
        while rx.try_recv().is_ok() {}
        assert_eq!(conn.info().queued, 0);
    }

    #[test]
    fn test_rejected_enqueue_is_not_counted() {
        let (mut conn, _rx) = make_connection(1);
        conn.set_open();
        conn.enqueue(Payload::text("1")).unwrap();
        assert!(conn.enqueue(Payload::text("2")).is_err());
        assert_eq!(conn.queued(), 1);
    }

    #[test]
    fn test_premature_buffer_bound() {
        let (mut conn, _rx) = make_connection(4);
        let id = ConnectionId::new(1);
        conn.buffer(Message::from_connection(id, Payload::text("a")), 2)
            .unwrap();
        conn.buffer(Message::from_connection(id, Payload::text("b")), 2)
            .unwrap();
        let result = conn.buffer(Message::from_connection(id, Payload::text("c")), 2);
        assert!(matches!(result, Err(RegistryError::PrematureMessage(_))));

        let buffered = conn.set_open();
        let texts: Vec<_> = buffered
            .iter()
            .map(|m| m.payload().as_text().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[test]
    fn test_touch_resets_idle() {
        let (conn, _rx) = make_connection(1);
        std::thread::sleep(Duration::from_millis(20));
        assert!(conn.idle() >= Duration::from_millis(20));
        conn.touch();
        assert!(conn.idle() < Duration::from_millis(20));
    }

    #[test]
    fn test_close_reason_serialization() {
        let json = serde_json::to_string(&CloseReason::IdleTimeout).unwrap();
        assert_eq!(json, "\"idle_timeout\"");
        let state = serde_json::to_string(&ConnectionState::Closing).unwrap();
        assert_eq!(state, "\"closing\"");
    }
}
