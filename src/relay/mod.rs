//! Message relay module
//!
//! Dispatches inbound messages to a pluggable handler and delivers the
//! handler's output with per-connection FIFO, at-most-once semantics.

mod dispatch;
mod handler;

pub use dispatch::*;
pub use handler::*;
