//! swarm-engine
//!
//! A BitTorrent swarm engine: verified piece storage, the peer wire protocol,
//! choking and piece selection, a Kademlia DHT and the per-torrent controller
//! tying them together.

pub mod bencode;
pub mod cli;
pub mod dht;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod scheduler;
pub mod storage;
pub mod swarm;
pub mod torrent;
pub mod tracker;

pub use error::{ErrorKind, TorrentError};

pub use torrent::{TorrentInfo, TorrentParser};
pub use protocol::{Handshake, Message, MessageId};
pub use peer::{PeerConnection, PeerInfo, PeerManager, PeerSession, PeerSource, SessionId};
pub use scheduler::{BandwidthPool, ChokeConfig, ChokeScheduler, PiecePicker};
pub use storage::{BitField, BlockStore, FileBlockStore, MemoryBlockStore, PieceStore};
pub use dht::{DhtHandle, DhtServiceConfig, NodeId, RoutingTable, DHT};
pub use swarm::{Runtime, RuntimeContext, Swarm, SwarmState, SwarmStats};
pub use tracker::{NullTracker, StaticTracker, Tracker, TrackerEvent};
pub use cli::{CliArgs, Config, ProgressDisplay};
