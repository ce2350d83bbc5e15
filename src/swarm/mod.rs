//! Swarm module
//!
//! The per-torrent controller plus the process-wide runtime it registers
//! with: shared listener, peer id, blacklist and DHT handle.

pub mod context;
pub mod controller;
pub mod listener;

pub use context::{Registration, Runtime, RuntimeContext, BLACKLIST_DURATION};
pub use controller::{Swarm, SwarmState, SwarmStats};
pub use listener::IncomingPeer;
