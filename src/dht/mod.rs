//! DHT (Distributed Hash Table) module
//!
//! Kademlia-style peer discovery: routing table, iterative searches,
//! announce tokens and the UDP task that drives them.

pub mod bootstrap;
pub mod dht;
pub mod ip_vote;
pub mod message;
pub mod node;
pub mod persist;
pub mod routing;
pub mod search;
pub mod service;

// Re-exports for convenience
pub use bootstrap::BootstrapConfig;
pub use dht::{DhtConfig, DhtEvent, DHT};
pub use message::{Body, DHTMessage, Query, QueryType, Response};
pub use node::{Node, NodeId, NodeState};
pub use persist::DhtState;
pub use routing::{InsertOutcome, KBucket, RoutingTable, K};
pub use search::{Search, SearchKind};
pub use service::{start, DhtCommand, DhtHandle, DhtServiceConfig};
