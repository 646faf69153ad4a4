//! Idle connection reaper

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, info};

use super::{CloseReason, ConnectionId, ConnectionRegistry};

/// Move every connection silent for longer than `idle_timeout` to `Closing`
///
/// Returns the connections that were transitioned by this pass.
pub async fn reap_idle(
    registry: &ConnectionRegistry,
    idle_timeout: Duration,
) -> Vec<ConnectionId> {
    let mut reaped = Vec::new();
    for id in registry.idle_connections(idle_timeout).await {
        if registry.begin_close(id, CloseReason::IdleTimeout).await {
            reaped.push(id);
        }
    }
    if !reaped.is_empty() {
        info!("Reaped {} idle connections", reaped.len());
    }
    reaped
}

/// Run the reaper until a shutdown signal arrives
///
/// Returns the total number of connections reaped.
pub async fn run_reaper(
    registry: Arc<ConnectionRegistry>,
    idle_timeout: Duration,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> usize {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let mut total = 0;

    debug!(
        "Reaper started (idle timeout {:?}, interval {:?})",
        idle_timeout, interval
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                total += reap_idle(&registry, idle_timeout).await.len();
            }
            _ = shutdown_rx.recv() => {
                debug!("Reaper stopping");
                break;
            }
        }
    }

    total
}
