//! Message relay
//!
//! Routes inbound messages to the configured handler and delivers the
//! resulting instructions through the registry. The relay never holds a
//! connection; every delivery re-resolves its target.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time;
use tracing::{debug, warn};

use super::MessageHandler;
use crate::config::RelayConfig;
use crate::message::{Message, Payload};
use crate::registry::{
    CloseReason, ConnectionId, ConnectionInfo, ConnectionRegistry, ConnectionState,
    RegistryError,
};

/// Errors that can occur during relay operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Handler timed out for connection {0}")]
    HandlerTimeout(ConnectionId),

    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
}

impl RelayError {
    /// Expected under normal connection churn; logged quietly
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            RelayError::Registry(
                RegistryError::ConnectionClosed(_) | RegistryError::UnknownConnection(_)
            )
        )
    }

    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            RelayError::Registry(RegistryError::BackpressureExceeded(_))
        )
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// What happened to a dispatched message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Held until the sender's handshake completes
    Buffered,
    /// Handler ran; its instructions were delivered or failed individually
    Handled {
        delivered: usize,
        failures: Vec<(ConnectionId, RelayError)>,
    },
}

impl DispatchOutcome {
    pub fn failures(&self) -> &[(ConnectionId, RelayError)] {
        match self {
            DispatchOutcome::Buffered => &[],
            DispatchOutcome::Handled { failures, .. } => failures,
        }
    }
}

/// Per-target result of a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<ConnectionId>,
    pub failed: Vec<(ConnectionId, RelayError)>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

/// Routes messages between connections
pub struct Relay<H> {
    registry: Arc<ConnectionRegistry>,
    handler: H,
    handler_timeout: Duration,
    max_payload_bytes: Option<usize>,
}

impl<H: MessageHandler> Relay<H> {
    /// Create a relay over `registry` using `handler`
    pub fn new(registry: Arc<ConnectionRegistry>, handler: H, config: &RelayConfig) -> Self {
        Self {
            registry,
            handler,
            handler_timeout: config.handler_timeout(),
            max_payload_bytes: config.max_payload_bytes,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Open a connection and replay anything it sent during its handshake
    ///
    /// Returns the number of messages the handler completed. Replay stops at
    /// the first handler failure and the rest of the buffer is discarded.
    pub async fn open(&self, id: ConnectionId) -> RelayResult<usize> {
        let buffered = self.registry.mark_open(id).await?;
        let total = buffered.len();
        let mut replayed = 0;

        for message in buffered {
            match self.run_handler(id, message).await {
                Ok(outcome) => {
                    log_failures(id, &outcome);
                    replayed += 1;
                }
                Err(e) => {
                    warn!(
                        "Replay for {} stopped after {} of {} messages, {} discarded: {}",
                        id,
                        replayed,
                        total,
                        total - replayed,
                        e
                    );
                    break;
                }
            }
        }

        if replayed > 0 {
            debug!("Replayed {} early messages for {}", replayed, id);
        }
        Ok(replayed)
    }

    /// Hand one inbound message to the handler and deliver its output
    pub async fn dispatch(
        &self,
        sender: ConnectionId,
        payload: Payload,
    ) -> RelayResult<DispatchOutcome> {
        if let Some(limit) = self.max_payload_bytes {
            if payload.len() > limit {
                return Err(RelayError::PayloadTooLarge {
                    size: payload.len(),
                    limit,
                });
            }
        }

        let info = self
            .registry
            .lookup(sender)
            .await
            .ok_or(RegistryError::ConnectionClosed(sender))?;

        debug!("Received message from {}: {}", sender, payload);
        let message = Message::from_connection(sender, payload);

        match info.state {
            ConnectionState::Open => self.run_handler(sender, message).await,
            ConnectionState::Connecting => {
                match self.registry.buffer_premature(sender, message.clone()).await {
                    Ok(()) => Ok(DispatchOutcome::Buffered),
                    // Handshake finished between the lookup and the buffer
                    Err(RegistryError::AlreadyOpen(_)) => self.run_handler(sender, message).await,
                    Err(e) => Err(e.into()),
                }
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(RegistryError::ConnectionClosed(sender).into())
            }
        }
    }

    async fn run_handler(
        &self,
        sender: ConnectionId,
        message: Message,
    ) -> RelayResult<DispatchOutcome> {
        let handled = time::timeout(self.handler_timeout, self.handler.handle(message)).await;
        let outbound = match handled {
            Ok(outbound) => outbound,
            Err(_) => {
                warn!(
                    "Handler for {} exceeded {:?}, closing connection",
                    sender, self.handler_timeout
                );
                self.registry
                    .begin_close(sender, CloseReason::HandlerTimeout)
                    .await;
                return Err(RelayError::HandlerTimeout(sender));
            }
        };

        let mut delivered = 0;
        let mut failures = Vec::new();
        for instruction in outbound {
            match self.deliver(instruction.target, instruction.payload).await {
                Ok(()) => delivered += 1,
                Err(e) => failures.push((instruction.target, e)),
            }
        }

        Ok(DispatchOutcome::Handled {
            delivered,
            failures,
        })
    }

    /// Queue a payload for one connection
    ///
    /// At-most-once: a failed delivery is reported, never retried.
    pub async fn deliver(&self, target: ConnectionId, payload: Payload) -> RelayResult<()> {
        self.registry.enqueue(target, payload).await?;
        debug!("Queued message for {}", target);
        Ok(())
    }

    /// Deliver a server-originated payload to one connection
    pub async fn notify(&self, target: ConnectionId, payload: Payload) -> RelayResult<()> {
        let message = Message::from_server(payload);
        debug!("Notice from {} to {}", message.origin(), target);
        self.deliver(target, message.payload().clone()).await
    }

    /// Deliver to every tracked connection matching `predicate`
    ///
    /// Failures are collected per target and never stop the remaining
    /// deliveries.
    pub async fn broadcast<P>(&self, payload: Payload, predicate: P) -> BroadcastReport
    where
        P: Fn(&ConnectionInfo) -> bool,
    {
        let snapshot = self.registry.enumerate().await;
        let mut report = BroadcastReport::default();

        for id in snapshot.iter() {
            let Some(info) = self.registry.lookup(id).await else {
                // Removed after the snapshot was taken
                report
                    .failed
                    .push((id, RegistryError::ConnectionClosed(id).into()));
                continue;
            };
            if !predicate(&info) {
                continue;
            }
            match self.deliver(id, payload.clone()).await {
                Ok(()) => report.delivered.push(id),
                Err(e) => report.failed.push((id, e)),
            }
        }

        debug!(
            "Broadcast delivered to {} of {} connections",
            report.delivered.len(),
            report.attempted()
        );
        report
    }

    /// Deliver to every open connection
    pub async fn broadcast_all(&self, payload: Payload) -> BroadcastReport {
        self.broadcast(payload, ConnectionInfo::is_open).await
    }
}

fn log_failures(sender: ConnectionId, outcome: &DispatchOutcome) {
    for (target, e) in outcome.failures() {
        if e.is_benign() {
            debug!("Delivery from {} to {} dropped: {}", sender, target, e);
        } else {
            warn!("Delivery from {} to {} failed: {}", sender, target, e);
        }
    }
}
