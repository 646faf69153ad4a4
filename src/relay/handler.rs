//! Message handlers
//!
//! A handler turns one inbound message into zero or more delivery
//! instructions. Handlers are injected into the relay at construction.

use std::future::Future;
use std::sync::Arc;

use crate::config::DEFAULT_ECHO_PREFIX;
use crate::message::{Message, Origin, Outbound};
use crate::registry::ConnectionRegistry;

/// Produces outbound instructions for an inbound message
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: Message) -> impl Future<Output = Vec<Outbound>> + Send;
}

/// Replies to the sender with the payload behind a fixed prefix
#[derive(Debug, Clone)]
pub struct EchoHandler {
    prefix: String,
}

impl EchoHandler {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_PREFIX)
    }
}

impl MessageHandler for EchoHandler {
    async fn handle(&self, message: Message) -> Vec<Outbound> {
        match message.origin() {
            Origin::Connection(sender) => {
                vec![Outbound::new(sender, message.payload().with_prefix(&self.prefix))]
            }
            // Nobody to answer
            Origin::Server => Vec::new(),
        }
    }
}

/// Relays every message unchanged to all other open connections
pub struct BroadcastHandler {
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastHandler {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

impl MessageHandler for BroadcastHandler {
    async fn handle(&self, message: Message) -> Vec<Outbound> {
        let sender = message.sender();
        let snapshot = self.registry.enumerate().await;

        let mut outbound = Vec::with_capacity(snapshot.len());
        for id in snapshot.iter() {
            if Some(id) == sender {
                continue;
            }
            let open = self
                .registry
                .lookup(id)
                .await
                .is_some_and(|info| info.is_open());
            if open {
                outbound.push(Outbound::new(id, message.payload().clone()));
            }
        }
        outbound
    }
}
