//! WebSocket server module
//!
//! Accepts client connections, turns socket traffic into relay calls and
//! flushes outbound queues back to the sockets.

#[allow(dead_code)]
mod gateway;
#[allow(dead_code)]
mod protocol;
mod websocket;

pub use gateway::*;
#[allow(unused_imports)]
pub use protocol::*;
pub use websocket::*;
