//! Message types shared by the registry and the relay
//!
//! Payloads are opaque and immutable: the relay never inspects or rewrites
//! them in place. Handlers derive new payloads instead.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::registry::ConnectionId;

/// Opaque message body
///
/// Reference counted so a broadcast shares a single allocation across all
/// of its targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(Arc<str>),
    Binary(Arc<[u8]>),
}

impl Payload {
    /// Create a text payload
    pub fn text(text: impl Into<String>) -> Self {
        let text: String = text.into();
        Payload::Text(Arc::from(text))
    }

    /// Create a binary payload
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Payload::Binary(Arc::from(data))
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes regardless of variant
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(data) => data,
        }
    }

    /// Text content, if this is a text payload
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    /// Build a new payload of the same kind with `prefix` in front
    pub fn with_prefix(&self, prefix: &str) -> Payload {
        match self {
            Payload::Text(text) => Payload::text(format!("{prefix}{text}")),
            Payload::Binary(data) => {
                let mut bytes = Vec::with_capacity(prefix.len() + data.len());
                bytes.extend_from_slice(prefix.as_bytes());
                bytes.extend_from_slice(data);
                Payload::binary(bytes)
            }
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Text(text) => f.write_str(text),
            Payload::Binary(data) => write!(f, "<{} bytes>", data.len()),
        }
    }
}

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A client connection
    Connection(ConnectionId),
    /// The relay itself
    Server,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Connection(id) => id.fmt(f),
            Origin::Server => f.write_str("server"),
        }
    }
}

/// An inbound message as handed to a handler
#[derive(Debug, Clone)]
pub struct Message {
    origin: Origin,
    payload: Payload,
    received_at: Instant,
}

impl Message {
    /// Message received from a client connection
    pub fn from_connection(sender: ConnectionId, payload: Payload) -> Self {
        Self {
            origin: Origin::Connection(sender),
            payload,
            received_at: Instant::now(),
        }
    }

    /// Message originated by the relay itself
    pub fn from_server(payload: Payload) -> Self {
        Self {
            origin: Origin::Server,
            payload,
            received_at: Instant::now(),
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Sending connection, or `None` for server-originated messages
    pub fn sender(&self) -> Option<ConnectionId> {
        match self.origin {
            Origin::Connection(id) => Some(id),
            Origin::Server => None,
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}

/// One delivery instruction produced by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub target: ConnectionId,
    pub payload: Payload,
}

impl Outbound {
    pub fn new(target: ConnectionId, payload: Payload) -> Self {
        Self { target, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_prefix() {
        let payload = Payload::text("hello");
        let reply = payload.with_prefix("Server response: ");
        assert_eq!(reply.as_text(), Some("Server response: hello"));
        // Original untouched
        assert_eq!(payload.as_text(), Some("hello"));
    }

    #[test]
    fn test_binary_prefix() {
        let payload = Payload::binary(vec![0u8, 1, 2]);
        let reply = payload.with_prefix("ok:");
        assert_eq!(reply.as_bytes(), b"ok:\x00\x01\x02");
        assert!(reply.as_text().is_none());
    }

    #[test]
    fn test_payload_len_and_display() {
        let text = Payload::text("héllo");
        assert_eq!(text.len(), 6);
        assert_eq!(text.to_string(), "héllo");

        let binary = Payload::binary(vec![1u8; 4]);
        assert_eq!(binary.len(), 4);
        assert_eq!(binary.to_string(), "<4 bytes>");
        assert!(Payload::text("").is_empty());
    }

    #[test]
    fn test_clone_shares_allocation() {
        let payload = Payload::text("shared");
        let copy = payload.clone();
        match (&payload, &copy) {
            (Payload::Text(a), Payload::Text(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("Expected text payloads"),
        }
    }

    #[test]
    fn test_message_origin() {
        let server = Message::from_server(Payload::text("notice"));
        assert_eq!(server.origin(), Origin::Server);
        assert!(server.sender().is_none());
        assert_eq!(server.origin().to_string(), "server");
    }
}
