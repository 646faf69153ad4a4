//! Connection registry module
//!
//! Owns every live connection and its lifecycle, plus the reaper that
//! closes connections which go quiet.

mod connection;
mod reaper;
mod store;

pub use connection::*;
pub use reaper::*;
pub use store::*;
