//! Wire protocol helpers
//!
//! Client payloads are opaque: text and binary frames map one-to-one onto
//! `Payload`. The only structured frames are the server's error notices,
//! which are JSON-encoded.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::message::Payload;
use crate::registry::{CloseReason, RegistryError};
use crate::relay::RelayError;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Inbound Frames
// ============================================================================

/// A WebSocket frame classified for the connection loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Application data for the relay
    Data(Payload),
    /// Keepalive ping carrying data to echo in the pong
    Ping(Vec<u8>),
    /// Keepalive pong
    Pong,
    /// Peer asked to close
    Close,
    /// Raw frame, nothing to do
    Ignored,
}

impl From<Message> for InboundFrame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => InboundFrame::Data(Payload::text(text)),
            Message::Binary(data) => InboundFrame::Data(Payload::binary(data)),
            Message::Ping(data) => InboundFrame::Ping(data),
            Message::Pong(_) => InboundFrame::Pong,
            Message::Close(_) => InboundFrame::Close,
            Message::Frame(_) => InboundFrame::Ignored,
        }
    }
}

// ============================================================================
// Outbound Frames
// ============================================================================

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Message::Text(text.to_string()),
            Payload::Binary(data) => Message::Binary(data.to_vec()),
        }
    }
}

impl CloseReason {
    /// WebSocket close code reported to the peer
    pub fn close_code(&self) -> CloseCode {
        match self {
            CloseReason::PeerClosed => CloseCode::Normal,
            CloseReason::Shutdown => CloseCode::Away,
            CloseReason::IdleTimeout | CloseReason::SlowConsumer => CloseCode::Policy,
            CloseReason::HandlerTimeout | CloseReason::TransportError => CloseCode::Error,
        }
    }
}

/// Build the close frame sent when the server ends a connection
pub fn close_message(reason: Option<CloseReason>) -> Message {
    let frame = match reason {
        Some(reason) => CloseFrame {
            code: reason.close_code(),
            reason: Cow::Borrowed(reason.as_str()),
        },
        None => CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(""),
        },
    };
    Message::Close(Some(frame))
}

// ============================================================================
// Server Notices
// ============================================================================

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RegistryExhausted,
    UnknownConnection,
    ConnectionClosed,
    PrematureMessage,
    BackpressureExceeded,
    HandlerTimeout,
    PayloadTooLarge,
}

impl From<&RelayError> for ErrorCode {
    fn from(err: &RelayError) -> Self {
        match err {
            RelayError::Registry(e) => match e {
                RegistryError::RegistryExhausted => ErrorCode::RegistryExhausted,
                RegistryError::UnknownConnection(_) => ErrorCode::UnknownConnection,
                RegistryError::ConnectionClosed(_) | RegistryError::AlreadyOpen(_) => {
                    ErrorCode::ConnectionClosed
                }
                RegistryError::PrematureMessage(_) => ErrorCode::PrematureMessage,
                RegistryError::BackpressureExceeded(_) => ErrorCode::BackpressureExceeded,
            },
            RelayError::HandlerTimeout(_) => ErrorCode::HandlerTimeout,
            RelayError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
        }
    }
}

/// Structured frames the server sends on its own behalf
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerNotice {
    /// A message from this client was rejected
    Error {
        /// Error code for programmatic handling
        code: ErrorCode,
        /// Human readable description
        message: String,
    },
}

impl ServerNotice {
    /// Encode as a text payload
    pub fn to_payload(&self) -> ProtocolResult<Payload> {
        Ok(Payload::text(serde_json::to_string(self)?))
    }

    /// Parse a notice from JSON (primarily for testing)
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl From<&RelayError> for ServerNotice {
    fn from(err: &RelayError) -> Self {
        ServerNotice::Error {
            code: err.into(),
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
