//! Transport boundary
//!
//! Translates socket events into registry and relay calls. Each connection
//! task calls into the gateway sequentially, which keeps inbound processing
//! for a single client strictly ordered.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::protocol::ServerNotice;
use crate::message::Payload;
use crate::registry::{CloseReason, ConnectionId, ConnectionRegistry, OutboundReceiver};
use crate::relay::{DispatchOutcome, MessageHandler, Relay, RelayError, RelayResult};

/// Glue between the WebSocket transport and the relay
pub struct Gateway<H> {
    relay: Relay<H>,
    disconnect_slow_consumers: bool,
}

impl<H: MessageHandler> Gateway<H> {
    /// Create a gateway over `relay`
    pub fn new(relay: Relay<H>) -> Self {
        Self {
            relay,
            disconnect_slow_consumers: false,
        }
    }

    /// Close targets whose outbound queue is full
    pub fn with_disconnect_slow_consumers(mut self, enabled: bool) -> Self {
        self.disconnect_slow_consumers = enabled;
        self
    }

    pub fn relay(&self) -> &Relay<H> {
        &self.relay
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.relay.registry()
    }

    /// A transport connection was accepted
    pub async fn on_connect(&self) -> RelayResult<(ConnectionId, OutboundReceiver)> {
        match self.registry().admit().await {
            Ok((id, rx)) => {
                info!("Client connected: {}", id);
                Ok((id, rx))
            }
            Err(e) => {
                error!("Rejecting connection: {}", e);
                Err(e.into())
            }
        }
    }

    /// The handshake completed
    pub async fn on_open(&self, id: ConnectionId) -> RelayResult<usize> {
        self.relay.open(id).await
    }

    /// A data frame arrived
    pub async fn on_message(
        &self,
        id: ConnectionId,
        payload: Payload,
    ) -> RelayResult<DispatchOutcome> {
        self.registry().touch(id).await;

        match self.relay.dispatch(id, payload).await {
            Ok(outcome) => {
                self.apply_delivery_failures(id, &outcome).await;
                Ok(outcome)
            }
            Err(e) => {
                self.report_rejection(id, &e).await;
                Err(e)
            }
        }
    }

    /// Keepalive traffic arrived
    pub async fn on_keepalive(&self, id: ConnectionId) {
        self.registry().touch(id).await;
    }

    /// The transport went away or the server decided to close
    pub async fn on_disconnect(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let transitioned = self.registry().begin_close(id, reason).await;
        if transitioned && reason == CloseReason::PeerClosed {
            info!("Client disconnected: {}", id);
        }
        transitioned
    }

    /// The connection's outbound queue has been flushed or discarded
    pub async fn on_drained(&self, id: ConnectionId) {
        // Make sure no path reaches finalize without closing first
        self.registry().begin_close(id, CloseReason::TransportError).await;
        if let Err(e) = self.registry().finalize_close(id).await {
            debug!("Finalize for {} skipped: {}", id, e);
        }
    }

    /// Move every connection to `Closing` for shutdown
    pub async fn shutdown(&self) -> usize {
        self.registry().close_all(CloseReason::Shutdown).await
    }

    async fn apply_delivery_failures(&self, sender: ConnectionId, outcome: &DispatchOutcome) {
        for (target, e) in outcome.failures() {
            if e.is_backpressure() {
                if self.disconnect_slow_consumers {
                    warn!("Disconnecting slow consumer {}", target);
                    self.registry()
                        .begin_close(*target, CloseReason::SlowConsumer)
                        .await;
                } else {
                    warn!("Dropped message from {} to {}: {}", sender, target, e);
                }
            } else if e.is_benign() {
                debug!("Dropped message from {} to {}: {}", sender, target, e);
            } else {
                warn!("Delivery from {} to {} failed: {}", sender, target, e);
            }
        }
    }

    async fn report_rejection(&self, id: ConnectionId, err: &RelayError) {
        match err {
            RelayError::PayloadTooLarge { .. } => {
                warn!("Rejected message from {}: {}", id, err);
                match ServerNotice::from(err).to_payload() {
                    Ok(notice) => {
                        if let Err(e) = self.relay.notify(id, notice).await {
                            debug!("Could not notify {}: {}", id, e);
                        }
                    }
                    Err(e) => error!("Failed to encode notice: {}", e),
                }
            }
            e if e.is_benign() => debug!("Dropped message from {}: {}", id, e),
            e => warn!("Rejected message from {}: {}", id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::registry::{ConnectionState, RegistryError};
    use crate::relay::EchoHandler;
    use crate::server::protocol::{ErrorCode, ServerNotice};

    fn gateway(config: &RelayConfig) -> Gateway<EchoHandler> {
        let registry = Arc::new(ConnectionRegistry::new(config));
        let relay = Relay::new(registry, EchoHandler::new(config.echo_prefix.clone()), config);
        Gateway::new(relay).with_disconnect_slow_consumers(config.disconnect_slow_consumers)
    }

    #[tokio::test]
    async fn test_connect_message_disconnect() {
        let gateway = gateway(&RelayConfig::default());
        let (id, mut rx) = gateway.on_connect().await.unwrap();
        assert_eq!(gateway.on_open(id).await.unwrap(), 0);

        gateway.on_message(id, Payload::text("hello")).await.unwrap();
        assert_eq!(rx.recv().await, Some(Payload::text("Server response: hello")));

        assert!(gateway.on_disconnect(id, CloseReason::PeerClosed).await);
        assert!(!gateway.on_disconnect(id, CloseReason::PeerClosed).await);
        assert_eq!(rx.recv().await, None);

        gateway.on_drained(id).await;
        assert!(gateway.registry().lookup(id).await.is_none());
        assert!(gateway.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_messages_during_handshake_are_replayed() {
        let gateway = gateway(&RelayConfig::default());
        let (id, mut rx) = gateway.on_connect().await.unwrap();

        let outcome = gateway.on_message(id, Payload::text("early")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Buffered);

        assert_eq!(gateway.on_open(id).await.unwrap(), 1);
        assert_eq!(rx.recv().await, Some(Payload::text("Server response: early")));
    }

    #[tokio::test]
    async fn test_oversized_payload_gets_error_notice() {
        let config = RelayConfig {
            max_payload_bytes: Some(8),
            ..Default::default()
        };
        let gateway = gateway(&config);
        let (id, mut rx) = gateway.on_connect().await.unwrap();
        gateway.on_open(id).await.unwrap();

        let result = gateway
            .on_message(id, Payload::text("much too long"))
            .await;
        assert!(matches!(result, Err(RelayError::PayloadTooLarge { .. })));

        let notice = rx.recv().await.unwrap();
        match ServerNotice::from_json(notice.as_text().unwrap()).unwrap() {
            ServerNotice::Error { code, .. } => assert_eq!(code, ErrorCode::PayloadTooLarge),
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_reply_by_default() {
        let config = RelayConfig {
            max_outbound_queue_per_connection: 1,
            ..Default::default()
        };
        let gateway = gateway(&config);
        let (id, _rx) = gateway.on_connect().await.unwrap();
        gateway.on_open(id).await.unwrap();

        gateway.on_message(id, Payload::text("1")).await.unwrap();
        let outcome = gateway.on_message(id, Payload::text("2")).await.unwrap();
        assert_eq!(
            outcome.failures(),
            &[(
                id,
                RelayError::Registry(RegistryError::BackpressureExceeded(id))
            )]
        );
        assert!(gateway.registry().lookup(id).await.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_full_queue_disconnects_slow_consumer_when_enabled() {
        let config = RelayConfig {
            max_outbound_queue_per_connection: 1,
            disconnect_slow_consumers: true,
            ..Default::default()
        };
        let gateway = gateway(&config);
        let (id, mut rx) = gateway.on_connect().await.unwrap();
        gateway.on_open(id).await.unwrap();

        gateway.on_message(id, Payload::text("1")).await.unwrap();
        gateway.on_message(id, Payload::text("2")).await.unwrap();

        let info = gateway.registry().lookup(id).await.unwrap();
        assert_eq!(info.state, ConnectionState::Closing);
        assert_eq!(info.close_reason, Some(CloseReason::SlowConsumer));

        // The message already queued is still flushed
        assert_eq!(rx.recv().await, Some(Payload::text("Server response: 1")));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let gateway = gateway(&RelayConfig::default());
        let (a, _rx_a) = gateway.on_connect().await.unwrap();
        let (b, _rx_b) = gateway.on_connect().await.unwrap();
        gateway.on_open(a).await.unwrap();

        assert_eq!(gateway.shutdown().await, 2);
        for id in [a, b] {
            let info = gateway.registry().lookup(id).await.unwrap();
            assert_eq!(info.close_reason, Some(CloseReason::Shutdown));
        }
    }

    #[tokio::test]
    async fn test_keepalive_touches_connection() {
        let gateway = gateway(&RelayConfig::default());
        let (id, _rx) = gateway.on_connect().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        gateway.on_keepalive(id).await;
        let idle = gateway.registry().lookup(id).await.unwrap().idle;
        assert!(idle < std::time::Duration::from_millis(30));
    }
}
