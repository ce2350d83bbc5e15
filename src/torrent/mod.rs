//! Torrent metadata module
//!
//! Parsing and structural validation of .torrent files.

pub mod parser;
pub mod info;

pub use parser::TorrentParser;
pub use info::{TorrentInfo, TorrentFile};
