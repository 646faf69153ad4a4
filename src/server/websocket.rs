//! WebSocket server implementation
//!
//! Listens on a configurable port, runs one task per client connection and
//! flushes each connection's outbound queue to its socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::gateway::Gateway;
use super::protocol::{close_message, InboundFrame};
use crate::config::RelayConfig;
use crate::registry::{run_reaper, CloseReason, ConnectionId, OutboundReceiver};
use crate::relay::MessageHandler;

/// How often shutdown checks whether every connection has drained
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self { bind, port }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server relaying messages between clients
pub struct WebSocketServer<H> {
    config: ServerConfig,
    relay_config: RelayConfig,
    gateway: Arc<Gateway<H>>,
    server_id: Uuid,
    shutdown_tx: broadcast::Sender<()>,
}

impl<H: MessageHandler> WebSocketServer<H> {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, relay_config: RelayConfig, gateway: Gateway<H>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            relay_config,
            gateway: Arc::new(gateway),
            server_id: Uuid::new_v4(),
            shutdown_tx,
        }
    }

    /// Identifier of this server instance, stable for the process lifetime
    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    pub fn gateway(&self) -> &Arc<Gateway<H>> {
        &self.gateway
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// Returns once a shutdown signal has been received and every connection
    /// has drained, or the shutdown grace period ran out.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "Relay server {} listening on ws://{}",
            self.server_id,
            listener.local_addr()?
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let reaper = tokio::spawn(run_reaper(
            Arc::clone(self.gateway.registry()),
            self.relay_config.idle_timeout(),
            self.relay_config.reap_interval(),
            self.shutdown_tx.subscribe(),
        ));

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let write_timeout = self.relay_config.idle_timeout();
                            let connection =
                                handle_connection(stream, peer_addr, gateway, write_timeout);

                            tokio::spawn(async move {
                                if let Err(e) = connection.await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        // Closing ends every outbound queue; connection tasks flush and exit
        let closing = self.gateway.shutdown().await;
        if closing > 0 {
            info!("Waiting for {} active connections to close...", closing);
        }

        let registry = Arc::clone(self.gateway.registry());
        let drained = time::timeout(self.relay_config.shutdown_grace(), async move {
            while !registry.is_empty().await {
                time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still open after shutdown grace period",
                self.gateway.registry().len().await
            );
        }

        let reaped = reaper.await.unwrap_or(0);
        debug!("Reaper closed {} idle connections during this run", reaped);

        Ok(())
    }
}

/// Handle a single WebSocket connection
async fn handle_connection<H: MessageHandler>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    gateway: Arc<Gateway<H>>,
    write_timeout: Duration,
) -> anyhow::Result<()> {
    let (id, outbound_rx) = gateway.on_connect().await?;
    info!("New connection {} from {}", id, peer_addr);

    let result = serve_connection(stream, id, &gateway, outbound_rx, write_timeout).await;

    gateway.on_drained(id).await;
    info!("Connection {} from {} closed", id, peer_addr);
    result
}

/// Handshake, then pump frames both ways until the connection closes
async fn serve_connection<H: MessageHandler>(
    stream: TcpStream,
    id: ConnectionId,
    gateway: &Gateway<H>,
    mut outbound_rx: OutboundReceiver,
    write_timeout: Duration,
) -> anyhow::Result<()> {
    // Upgrade to WebSocket, unless the reaper or shutdown closes us first
    let ws_stream = tokio::select! {
        result = accept_async(stream) => match result {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                gateway.on_disconnect(id, CloseReason::TransportError).await;
                return Err(e.into());
            }
        },
        _ = queue_ended(&mut outbound_rx) => {
            debug!("Connection {} closed before completing the handshake", id);
            return Ok(());
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    if let Err(e) = gateway.on_open(id).await {
        // Closed while handshaking, e.g. by the reaper or shutdown
        debug!("Connection {} not opened: {}", id, e);
        let reason = gateway.registry().lookup(id).await.and_then(|i| i.close_reason);
        send_frame(&mut ws_sender, close_message(reason), write_timeout).await;
        return Ok(());
    }

    // Message handling loop
    loop {
        tokio::select! {
            // Receive messages from client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(message)) => match InboundFrame::from(message) {
                        InboundFrame::Data(payload) => {
                            // Failures are logged by the gateway; a handler
                            // timeout leaves the connection closing and the
                            // queue flushes before the loop exits
                            let _ = gateway.on_message(id, payload).await;
                        }
                        InboundFrame::Ping(data) => {
                            gateway.on_keepalive(id).await;
                            let pong = Message::Pong(data);
                            let sent = send_frame(&mut ws_sender, pong, write_timeout).await;
                            if let Some(reason) = sent.close_reason() {
                                warn!("Failed to answer ping on {}: {}", id, sent);
                                gateway.on_disconnect(id, reason).await;
                                break;
                            }
                        }
                        InboundFrame::Pong => {
                            gateway.on_keepalive(id).await;
                        }
                        InboundFrame::Close => {
                            info!("Client {} requested close", id);
                            gateway.on_disconnect(id, CloseReason::PeerClosed).await;
                            break;
                        }
                        InboundFrame::Ignored => {}
                    },
                    Some(Err(e)) => {
                        error!("WebSocket error on {}: {}", id, e);
                        gateway.on_disconnect(id, CloseReason::TransportError).await;
                        break;
                    }
                    None => {
                        gateway.on_disconnect(id, CloseReason::PeerClosed).await;
                        break;
                    }
                }
            }
            // Flush queued messages in order
            queued = outbound_rx.recv() => {
                match queued {
                    Some(payload) => {
                        let frame = Message::from(payload);
                        let sent = send_frame(&mut ws_sender, frame, write_timeout).await;
                        if let Some(reason) = sent.close_reason() {
                            warn!("Failed to send to {}: {}", id, sent);
                            gateway.on_disconnect(id, reason).await;
                            break;
                        }
                    }
                    None => {
                        // Queue ended by a server-side close, everything flushed
                        let info = gateway.registry().lookup(id).await;
                        let reason = info.and_then(|i| i.close_reason);
                        debug!("Closing {} after flush: {:?}", id, reason);
                        send_frame(&mut ws_sender, close_message(reason), write_timeout).await;
                        break;
                    }
                }
            }
        }
    }

    // The peer is gone; whatever is still queued cannot be delivered
    outbound_rx.close();
    let mut discarded = 0;
    while outbound_rx.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!("Discarded {} undelivered messages for {}", discarded, id);
    }

    Ok(())
}

/// Resolves once the outbound queue has ended
///
/// Only used before the connection is open, when nothing can be queued yet.
async fn queue_ended(outbound_rx: &mut OutboundReceiver) {
    while outbound_rx.recv().await.is_some() {}
}

/// Result of writing one frame to a peer
#[derive(Debug)]
enum SendOutcome {
    Sent,
    Failed(WsError),
    /// The peer stopped reading and the write could not complete in time
    TimedOut(Duration),
}

impl SendOutcome {
    /// How the connection should close after this write, if at all
    fn close_reason(&self) -> Option<CloseReason> {
        match self {
            SendOutcome::Sent => None,
            SendOutcome::Failed(_) => Some(CloseReason::TransportError),
            SendOutcome::TimedOut(_) => Some(CloseReason::SlowConsumer),
        }
    }
}

impl std::fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendOutcome::Sent => f.write_str("sent"),
            SendOutcome::Failed(e) => write!(f, "{}", e),
            SendOutcome::TimedOut(limit) => write!(f, "write blocked for more than {:?}", limit),
        }
    }
}

/// Write one frame, giving up after `limit`
async fn send_frame<S>(sink: &mut S, frame: Message, limit: Duration) -> SendOutcome
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    match time::timeout(limit, sink.send(frame)).await {
        Ok(Ok(())) => SendOutcome::Sent,
        Ok(Err(e)) => SendOutcome::Failed(e),
        Err(_) => SendOutcome::TimedOut(limit),
    }
}
