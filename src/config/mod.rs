//! Configuration module
//!
//! Handles loading relay configuration from disk.

mod relay;

pub use relay::*;
