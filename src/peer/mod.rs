//! Peer management module
//!
//! Per-connection sessions, socket tasks and the address pool.

pub mod connection;
pub mod manager;
pub mod state;

// Re-export main types
pub use connection::{PeerConnection, PeerEvent, PeerEventKind, PeerSender};
pub use manager::PeerManager;
pub use state::{BlockRequest, PeerInfo, PeerSession, PeerSource, PeerStats, SessionId, SessionState};
