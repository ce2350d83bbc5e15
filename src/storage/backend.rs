//! Block store abstraction
//!
//! The swarm reads and writes piece data only through [`BlockStore`], so the
//! engine works the same against disk files or an in-memory buffer.

use async_trait::async_trait;
use bytes::Bytes;
use anyhow::Result;
use tracing::trace;

use crate::error::TorrentError;
use crate::torrent::TorrentInfo;

/// Abstract piece data store, addressed by piece index and offset
#[async_trait]
pub trait BlockStore: Send {
    /// Read `len` bytes of piece `piece` starting at `offset`
    async fn read_block(&mut self, piece: u32, offset: u32, len: u32) -> Result<Bytes>;

    /// Write `data` into piece `piece` at `offset`
    async fn write_block(&mut self, piece: u32, offset: u32, data: &[u8]) -> Result<()>;

    /// Flush buffered writes
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Storage type identifier
    fn storage_type(&self) -> StorageType;
}

/// Storage type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// Local filesystem storage
    File,
    /// Process memory
    Memory,
}

/// Whole-torrent buffer kept in memory
#[derive(Debug, Clone)]
pub struct MemoryBlockStore {
    piece_length: u64,
    data: Vec<u8>,
}

impl MemoryBlockStore {
    /// Create a zero-filled store for `torrent`
    pub fn new(torrent: &TorrentInfo) -> Self {
        Self {
            piece_length: torrent.piece_length,
            data: vec![0u8; torrent.total_size() as usize],
        }
    }

    /// Create a store pre-filled with `content`
    pub fn with_content(piece_length: u64, content: Vec<u8>) -> Self {
        Self {
            piece_length,
            data: content,
        }
    }

    /// Entire stored payload
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, piece: u32, offset: u32, len: usize) -> Result<std::ops::Range<usize>> {
        let start = piece as u64 * self.piece_length + offset as u64;
        let end = start + len as u64;
        if end > self.data.len() as u64 {
            return Err(TorrentError::storage_error(format!(
                "Block {}:{}+{} beyond end of data ({} bytes)",
                piece,
                offset,
                len,
                self.data.len()
            )).into());
        }
        Ok(start as usize..end as usize)
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn read_block(&mut self, piece: u32, offset: u32, len: u32) -> Result<Bytes> {
        let range = self.range(piece, offset, len as usize)?;
        Ok(Bytes::copy_from_slice(&self.data[range]))
    }

    async fn write_block(&mut self, piece: u32, offset: u32, data: &[u8]) -> Result<()> {
        let range = self.range(piece, offset, data.len())?;
        trace!("Memory write piece {} offset {} ({} bytes)", piece, offset, data.len());
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_read_write() {
        let mut store = MemoryBlockStore::with_content(8, vec![0u8; 20]);
        store.write_block(1, 2, &[1, 2, 3]).await.unwrap();
        assert_eq!(&store.contents()[10..13], &[1, 2, 3]);
        assert_eq!(store.read_block(1, 2, 3).await.unwrap(), Bytes::from_static(&[1, 2, 3]));
    }

    #[tokio::test]
    async fn test_memory_store_out_of_range() {
        let mut store = MemoryBlockStore::with_content(8, vec![0u8; 20]);
        assert!(store.write_block(2, 0, &[0u8; 5]).await.is_err());
        assert!(store.read_block(2, 4, 1).await.is_err());
    }
}
