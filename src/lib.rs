//! Roomcast - a room-scoped WebSocket broadcast layer
//!
//! One logical namespace of connections can be served by many independent
//! server processes while clients perceive a single coherent room: local
//! fan-out goes through an in-process adapter, cross-process fan-out through
//! a broker with origin filtering, and membership survives crashes through
//! TTL-leased cluster records.

pub mod auth;
pub mod client;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;

// Re-export main components
pub use config::*;
pub use constants::*;
