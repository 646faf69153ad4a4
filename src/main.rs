//! Relay Gateway Server
//!
//! WebSocket message relay. Tracks client connections through their
//! lifecycle and routes every inbound message through a pluggable handler;
//! the default handler echoes each message back to its sender.

mod config;
#[allow(dead_code)]
mod message;
#[allow(dead_code)]
mod registry;
#[allow(dead_code)]
mod relay;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{RelayConfig, CONFIG_FILE};
use registry::ConnectionRegistry;
use relay::{BroadcastHandler, EchoHandler, MessageHandler, Relay};
use server::{Gateway, ServerConfig, WebSocketServer};

/// How inbound messages are routed
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Reply to the sender with a prefixed copy
    Echo,
    /// Forward to every other open connection
    Broadcast,
}

/// Relay Gateway Server
///
/// WebSocket message relay with connection lifecycle tracking
#[derive(Parser, Debug)]
#[command(name = "relay-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Relay configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Close connections idle for longer than this many milliseconds
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Maximum pending outbound messages per connection
    #[arg(long)]
    max_outbound_queue: Option<usize>,

    /// Abandon handler calls that take longer than this many milliseconds
    #[arg(long)]
    handler_timeout_ms: Option<u64>,

    /// Message routing mode
    #[arg(long, value_enum, default_value_t = Mode::Echo)]
    mode: Mode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Relay Gateway v{}", env!("CARGO_PKG_VERSION"));

    let relay_config = load_relay_config(&args)?;
    info!(
        "Idle timeout {}ms, outbound queue {}, handler timeout {}ms",
        relay_config.idle_timeout_ms,
        relay_config.max_outbound_queue_per_connection,
        relay_config.handler_timeout_ms
    );

    let server_config = ServerConfig::new(args.bind, args.port);
    let registry = Arc::new(ConnectionRegistry::new(&relay_config));

    match args.mode {
        Mode::Echo => {
            let handler = EchoHandler::new(relay_config.echo_prefix.clone());
            serve(server_config, relay_config, registry, handler).await?;
        }
        Mode::Broadcast => {
            let handler = BroadcastHandler::new(Arc::clone(&registry));
            serve(server_config, relay_config, registry, handler).await?;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Load the relay configuration and apply command line overrides
fn load_relay_config(args: &Args) -> anyhow::Result<RelayConfig> {
    let config = match &args.config {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            info!("Loading config from {}", path.display());
            RelayConfig::load(path)?
        }
        None => RelayConfig::load(Path::new(CONFIG_FILE))?,
    };

    let config = config
        .with_idle_timeout_ms(args.idle_timeout_ms)
        .with_max_outbound_queue(args.max_outbound_queue)
        .with_handler_timeout_ms(args.handler_timeout_ms);
    config.validate()?;
    Ok(config)
}

/// Build the relay stack around `handler` and run it until shutdown
async fn serve<H: MessageHandler>(
    server_config: ServerConfig,
    relay_config: RelayConfig,
    registry: Arc<ConnectionRegistry>,
    handler: H,
) -> anyhow::Result<()> {
    let relay = Relay::new(registry, handler, &relay_config);
    let gateway =
        Gateway::new(relay).with_disconnect_slow_consumers(relay_config.disconnect_slow_consumers);

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(server_config, relay_config, gateway));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["relay-gateway"]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.bind, "127.0.0.1");
        assert!(matches!(args.mode, Mode::Echo));
        assert!(args.config.is_none());
    }

    #[test]
    fn test_args_overrides_apply() {
        let args = Args::parse_from([
            "relay-gateway",
            "--idle-timeout-ms",
            "1500",
            "--max-outbound-queue",
            "8",
            "--mode",
            "broadcast",
        ]);
        assert!(matches!(args.mode, Mode::Broadcast));

        let config = load_relay_config(&args).unwrap();
        assert_eq!(config.idle_timeout_ms, 1500);
        assert_eq!(config.max_outbound_queue_per_connection, 8);
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let args = Args::parse_from(["relay-gateway", "--config", "/nonexistent/relay.toml"]);
        assert!(load_relay_config(&args).is_err());
    }

    #[test]
    fn test_zero_queue_override_rejected() {
        let args = Args::parse_from(["relay-gateway", "--max-outbound-queue", "0"]);
        assert!(load_relay_config(&args).is_err());
    }
}
