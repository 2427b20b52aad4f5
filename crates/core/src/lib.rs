//! Veil Core Types
//!
//! Shared data structures and the wire codec for the Veil onion relay.

pub mod config;
mod frames;
mod types;

pub use config::{Config, ConfigError};
pub use frames::*;
pub use types::*;
