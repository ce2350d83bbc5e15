//! Peer wire protocol module
//!
//! Handshake, message catalogue and resumable framing.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{BitTorrentWire, FrameDecoder, WireProtocol, DEFAULT_MAX_FRAME};
