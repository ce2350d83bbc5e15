//! Storage module
//!
//! Piece bookkeeping and verification over pluggable block storage.

pub mod backend;
pub mod bitfield;
pub mod file;
pub mod piece;

// Re-export backend types
pub use backend::{BlockStore, MemoryBlockStore, StorageType};

pub use bitfield::BitField;

// Re-export file storage types
pub use file::{FileBlockStore, FileEntry};

// Re-export piece types
pub use piece::{BlockKey, BlockOutcome, PieceState, PieceStore, Validation, BLOCK_SIZE};
