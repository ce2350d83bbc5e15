//! Piece storage module
//!
//! Authoritative record of which blocks are present, validated or in flight.
//! Completing a piece's block map validates it synchronously before the
//! call returns, so no further block for that piece is accepted on stale state.

use std::collections::HashMap;

use anyhow::Result;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::SessionId;
use crate::storage::backend::BlockStore;
use crate::storage::bitfield::BitField;
use crate::torrent::TorrentInfo;

/// Wire-level transfer unit
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Lifecycle of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceState {
    /// No blocks present
    #[default]
    Pending,
    /// Some blocks present or assigned
    Downloading,
    /// All blocks present, digest being checked
    Validating,
    /// Digest matched
    Complete,
}

/// Block address: piece index and block index within the piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub piece: u32,
    pub block: u32,
}

impl BlockKey {
    pub fn new(piece: u32, block: u32) -> Self {
        Self { piece, block }
    }

    /// Byte offset of the block within its piece
    pub fn offset(&self) -> u32 {
        self.block * BLOCK_SIZE
    }
}

/// Result of checking a fully assembled piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    /// Digest mismatch; the piece was reset. Lists the sessions that supplied its blocks.
    Invalid { contributors: Vec<SessionId> },
}

/// Result of [`PieceStore::store_block`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Block was already present; nothing written
    Duplicate,
    Accepted {
        /// Other sessions that had the same block outstanding (end-game)
        cancel: Vec<SessionId>,
        /// Set when this block completed the piece
        validation: Option<Validation>,
    },
}

#[derive(Debug, Clone)]
struct Piece {
    length: u32,
    digest: [u8; 20],
    state: PieceState,
    block_map: BitField,
    sources: Vec<Option<SessionId>>,
}

/// Manages piece and block bookkeeping for one torrent
#[derive(Debug)]
pub struct PieceStore {
    pieces: Vec<Piece>,
    piece_length: u32,
    have: BitField,
    bytes_remaining: u64,
    assignments: HashMap<BlockKey, Vec<SessionId>>,
    validations: u64,
}

impl PieceStore {
    /// Create a piece store with nothing downloaded
    pub fn new(torrent: &TorrentInfo) -> Self {
        let pieces: Vec<Piece> = torrent
            .pieces
            .iter()
            .enumerate()
            .map(|(index, digest)| {
                let length = torrent.piece_size(index);
                let blocks = length.div_ceil(BLOCK_SIZE) as usize;
                Piece {
                    length,
                    digest: *digest,
                    state: PieceState::Pending,
                    block_map: BitField::new(blocks),
                    sources: vec![None; blocks],
                }
            })
            .collect();

        debug!("Initialized {} pieces", pieces.len());
        Self {
            have: BitField::new(pieces.len()),
            pieces,
            piece_length: torrent.piece_length as u32,
            bytes_remaining: torrent.total_size(),
            assignments: HashMap::new(),
            validations: 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Byte length of piece `piece`
    pub fn piece_size(&self, piece: u32) -> u32 {
        self.pieces.get(piece as usize).map_or(0, |p| p.length)
    }

    /// Number of blocks in piece `piece`
    pub fn block_count(&self, piece: u32) -> u32 {
        self.pieces.get(piece as usize).map_or(0, |p| p.block_map.len() as u32)
    }

    /// Byte length of block `key`; the last block of a piece may be short
    pub fn block_length(&self, key: BlockKey) -> u32 {
        let size = self.piece_size(key.piece);
        size.saturating_sub(key.offset()).min(BLOCK_SIZE)
    }

    pub fn piece_state(&self, piece: u32) -> Option<PieceState> {
        self.pieces.get(piece as usize).map(|p| p.state)
    }

    /// Local completion bitfield
    pub fn have(&self) -> &BitField {
        &self.have
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_remaining
    }

    pub fn is_complete(&self) -> bool {
        self.have.all_set()
    }

    /// Total digest checks performed so far
    pub fn validations(&self) -> u64 {
        self.validations
    }

    /// Download progress (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.pieces.is_empty() {
            0.0
        } else {
            self.have.count_set() as f64 / self.pieces.len() as f64
        }
    }

    /// Check a peer's request against piece bounds and the length limit
    pub fn check_request(&self, piece: u32, offset: u32, length: u32, max_length: u32) -> Result<()> {
        let Some(p) = self.pieces.get(piece as usize) else {
            return Err(TorrentError::protocol_violation_field(
                format!("Request for piece {} of {}", piece, self.pieces.len()),
                "index",
            ).into());
        };
        if length == 0 || length > max_length {
            return Err(TorrentError::protocol_violation_field(
                format!("Request length {} outside 1..={}", length, max_length),
                "length",
            ).into());
        }
        if offset as u64 + length as u64 > p.length as u64 {
            return Err(TorrentError::protocol_violation_field(
                format!("Request {}+{} beyond piece {} of {} bytes", offset, length, piece, p.length),
                "begin",
            ).into());
        }
        Ok(())
    }

    /// Whether block `key` is already stored
    pub fn has_block(&self, key: BlockKey) -> bool {
        self.pieces
            .get(key.piece as usize)
            .map_or(false, |p| p.state == PieceState::Complete || p.block_map.get(key.block as usize))
    }

    /// Whether the piece has blocks present or assigned but is not complete
    pub fn is_partial(&self, piece: u32) -> bool {
        self.piece_state(piece) == Some(PieceState::Downloading)
    }

    /// Sessions with block `key` outstanding
    pub fn assignees(&self, key: BlockKey) -> &[SessionId] {
        self.assignments.get(&key).map_or(&[], Vec::as_slice)
    }

    /// Record that `peer` has requested block `key`
    pub fn assign(&mut self, key: BlockKey, peer: SessionId) {
        let entry = self.assignments.entry(key).or_default();
        if !entry.contains(&peer) {
            entry.push(peer);
        }
        if let Some(p) = self.pieces.get_mut(key.piece as usize) {
            if p.state == PieceState::Pending {
                p.state = PieceState::Downloading;
            }
        }
    }

    /// Drop `peer`'s assignment of block `key`
    pub fn unassign(&mut self, key: BlockKey, peer: SessionId) {
        if let Some(entry) = self.assignments.get_mut(&key) {
            entry.retain(|&p| p != peer);
            if entry.is_empty() {
                self.assignments.remove(&key);
                self.settle(key.piece);
            }
        }
    }

    /// Release every block assigned to `peer`, returning them
    pub fn release_peer(&mut self, peer: SessionId) -> Vec<BlockKey> {
        let mut released = Vec::new();
        self.assignments.retain(|key, peers| {
            if let Some(pos) = peers.iter().position(|&p| p == peer) {
                peers.remove(pos);
                released.push(*key);
            }
            !peers.is_empty()
        });
        for key in &released {
            self.settle(key.piece);
        }
        if !released.is_empty() {
            debug!("Released {} block assignments from {}", released.len(), peer);
        }
        released
    }

    /// A downloading piece with no blocks and no assignments goes back to pending
    fn settle(&mut self, piece: u32) {
        let assigned = self.assignments.keys().any(|k| k.piece == piece);
        if let Some(p) = self.pieces.get_mut(piece as usize) {
            if p.state == PieceState::Downloading && !p.block_map.any_set() && !assigned {
                p.state = PieceState::Pending;
            }
        }
    }

    /// Blocks of `piece` that are neither stored nor assigned
    pub fn unassigned_blocks(&self, piece: u32) -> impl Iterator<Item = BlockKey> + '_ {
        let blocks = match self.pieces.get(piece as usize) {
            Some(p) if p.state != PieceState::Complete => p.block_map.len() as u32,
            _ => 0,
        };
        (0..blocks)
            .map(move |block| BlockKey::new(piece, block))
            .filter(move |key| !self.has_block(*key) && !self.assignments.contains_key(key))
    }

    /// Blocks of `piece` that are not stored yet, assigned or not
    pub fn missing_blocks(&self, piece: u32) -> impl Iterator<Item = BlockKey> + '_ {
        let blocks = match self.pieces.get(piece as usize) {
            Some(p) if p.state != PieceState::Complete => p.block_map.len() as u32,
            _ => 0,
        };
        (0..blocks)
            .map(move |block| BlockKey::new(piece, block))
            .filter(move |key| !self.has_block(*key))
    }

    /// Whether every missing block of every incomplete piece has a downloader
    pub fn all_needed_assigned(&self) -> bool {
        (0..self.pieces.len() as u32).all(|piece| self.unassigned_blocks(piece).next().is_none())
    }

    /// Accept a received block, writing it through `store`.
    ///
    /// Completing the block map validates the piece before returning.
    pub async fn store_block(
        &mut self,
        store: &mut dyn BlockStore,
        piece: u32,
        offset: u32,
        data: &[u8],
        from: SessionId,
    ) -> Result<BlockOutcome> {
        let Some(p) = self.pieces.get(piece as usize) else {
            return Err(TorrentError::protocol_violation_field(
                format!("Block for piece {} of {}", piece, self.pieces.len()),
                "index",
            ).into());
        };
        if offset % BLOCK_SIZE != 0 || offset >= p.length {
            return Err(TorrentError::protocol_violation_field(
                format!("Block offset {} invalid for piece {} of {} bytes", offset, piece, p.length),
                "begin",
            ).into());
        }
        let key = BlockKey::new(piece, offset / BLOCK_SIZE);
        let expected = self.block_length(key);
        if data.len() as u32 != expected {
            return Err(TorrentError::protocol_violation_field(
                format!("Block {}:{} has {} bytes, expected {}", piece, offset, data.len(), expected),
                "block",
            ).into());
        }

        if self.has_block(key) {
            trace!("Duplicate block {}:{} from {}", piece, offset, from);
            self.unassign(key, from);
            return Ok(BlockOutcome::Duplicate);
        }

        store.write_block(piece, offset, data).await?;

        let cancel: Vec<SessionId> = self
            .assignments
            .remove(&key)
            .unwrap_or_default()
            .into_iter()
            .filter(|&p| p != from)
            .collect();

        let p = &mut self.pieces[piece as usize];
        p.block_map.set(key.block as usize, true);
        p.sources[key.block as usize] = Some(from);
        p.state = PieceState::Downloading;
        trace!("Stored block {}:{} from {} ({}/{})", piece, offset, from, p.block_map.count_set(), p.block_map.len());

        let validation = if p.block_map.all_set() {
            Some(self.validate_piece(store, piece).await?)
        } else {
            None
        };

        Ok(BlockOutcome::Accepted { cancel, validation })
    }

    /// Recompute the digest of an assembled piece and settle its state
    pub async fn validate_piece(&mut self, store: &mut dyn BlockStore, piece: u32) -> Result<Validation> {
        let length = self.piece_size(piece);
        let p = &mut self.pieces[piece as usize];
        p.state = PieceState::Validating;
        self.validations += 1;

        let data = match store.read_block(piece, 0, length).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Piece {} unreadable for validation, discarding its blocks: {:#}", piece, e);
                self.reset_piece(piece);
                return Err(TorrentError::storage_error(e.to_string())
                    .with_context(format!("validating piece {}", piece))
                    .into());
            }
        };
        let p = &mut self.pieces[piece as usize];
        if digest(&data) == p.digest {
            p.state = PieceState::Complete;
            p.sources.iter_mut().for_each(|s| *s = None);
            self.have.set(piece as usize, true);
            self.bytes_remaining -= length as u64;
            self.assignments.retain(|k, _| k.piece != piece);
            debug!("Piece {} verified ({} remaining bytes)", piece, self.bytes_remaining);
            if self.have.all_set() {
                info!("All {} pieces verified", self.pieces.len());
            }
            Ok(Validation::Valid)
        } else {
            let mut contributors: Vec<SessionId> = p.sources.iter().flatten().copied().collect();
            contributors.sort_unstable();
            contributors.dedup();
            warn!("{}; contributors {:?}", TorrentError::checksum_mismatch(piece), contributors);
            self.reset_piece(piece);
            Ok(Validation::Invalid { contributors })
        }
    }

    /// Drop every stored block of `piece` so it can be fetched again
    fn reset_piece(&mut self, piece: u32) {
        let p = &mut self.pieces[piece as usize];
        p.block_map.clear_all();
        p.sources.iter_mut().for_each(|s| *s = None);
        p.state = PieceState::Pending;
        self.settle(piece);
    }

    /// Hash-check data already in `store`, marking matching pieces complete.
    ///
    /// Unreadable pieces count as missing.
    pub async fn verify_existing(&mut self, store: &mut dyn BlockStore) -> Result<usize> {
        let mut found = 0;
        for piece in 0..self.pieces.len() as u32 {
            if self.pieces[piece as usize].state == PieceState::Complete {
                continue;
            }
            let length = self.piece_size(piece);
            let data = match store.read_block(piece, 0, length).await {
                Ok(data) => data,
                Err(e) => {
                    trace!("Piece {} unreadable during check: {}", piece, e);
                    continue;
                }
            };
            if digest(&data) == self.pieces[piece as usize].digest {
                let p = &mut self.pieces[piece as usize];
                p.state = PieceState::Complete;
                for block in 0..p.block_map.len() {
                    p.block_map.set(block, true);
                }
                self.have.set(piece as usize, true);
                self.bytes_remaining -= length as u64;
                found += 1;
            }
        }
        info!("Existing data check: {}/{} pieces present", found, self.pieces.len());
        Ok(found)
    }

    /// Read a block to serve a peer request; the piece must be complete
    pub async fn read_block(&self, store: &mut dyn BlockStore, piece: u32, offset: u32, length: u32) -> Result<Bytes> {
        if !self.have.get(piece as usize) {
            return Err(TorrentError::protocol_violation_field(
                format!("Request for piece {} which is not available", piece),
                "index",
            ).into());
        }
        store.read_block(piece, offset, length).await
    }
}

fn digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryBlockStore;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn setup(len: usize) -> (TorrentInfo, PieceStore, MemoryBlockStore, Vec<u8>) {
        let data = content(len);
        let torrent = TorrentInfo::for_content("t", 16384, &data);
        let store = PieceStore::new(&torrent);
        let blocks = MemoryBlockStore::new(&torrent);
        (torrent, store, blocks, data)
    }

    #[tokio::test]
    async fn test_full_download_scenario_sets_all_bits() {
        let (_, mut store, mut blocks, data) = setup(3 * 16384 + 8000);
        assert_eq!(store.piece_count(), 4);
        assert_eq!(store.piece_size(3), 8000);
        assert_eq!(store.block_length(BlockKey::new(3, 0)), 8000);

        for piece in 0..4u32 {
            let start = piece as usize * 16384;
            let end = (start + 16384).min(data.len());
            let outcome = store
                .store_block(&mut blocks, piece, 0, &data[start..end], SessionId(1))
                .await
                .unwrap();
            assert_eq!(outcome, BlockOutcome::Accepted { cancel: vec![], validation: Some(Validation::Valid) });
        }

        assert!(store.have().all_set());
        assert!(store.is_complete());
        assert_eq!(store.bytes_remaining(), 0);
        assert_eq!(blocks.contents(), &data[..]);
    }

    #[tokio::test]
    async fn test_validation_runs_once_per_completion() {
        let data = content(2 * 16384);
        let torrent = TorrentInfo::for_content("t", 32768, &data);
        let mut store = PieceStore::new(&torrent);
        let mut blocks = MemoryBlockStore::new(&torrent);

        let first = store.store_block(&mut blocks, 0, 0, &data[..16384], SessionId(1)).await.unwrap();
        assert!(matches!(first, BlockOutcome::Accepted { validation: None, .. }));
        assert_eq!(store.validations(), 0);

        let second = store.store_block(&mut blocks, 0, 16384, &data[16384..], SessionId(2)).await.unwrap();
        assert!(matches!(second, BlockOutcome::Accepted { validation: Some(Validation::Valid), .. }));
        assert_eq!(store.validations(), 1);

        let again = store.store_block(&mut blocks, 0, 16384, &data[16384..], SessionId(3)).await.unwrap();
        assert_eq!(again, BlockOutcome::Duplicate);
        assert_eq!(store.validations(), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_resets_piece_and_names_contributors() {
        let data = content(2 * 16384);
        let torrent = TorrentInfo::for_content("t", 32768, &data);
        let mut store = PieceStore::new(&torrent);
        let mut blocks = MemoryBlockStore::new(&torrent);

        store.store_block(&mut blocks, 0, 0, &data[..16384], SessionId(4)).await.unwrap();
        let outcome = store
            .store_block(&mut blocks, 0, 16384, &vec![0u8; 16384], SessionId(9))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            BlockOutcome::Accepted {
                cancel: vec![],
                validation: Some(Validation::Invalid { contributors: vec![SessionId(4), SessionId(9)] }),
            }
        );
        assert_eq!(store.piece_state(0), Some(PieceState::Pending));
        assert_eq!(store.unassigned_blocks(0).count(), 2);
        assert_eq!(store.bytes_remaining(), 32768);
    }

    /// Memory store whose next `failures` reads fail
    struct FlakyStore {
        inner: MemoryBlockStore,
        failures: usize,
    }

    #[async_trait::async_trait]
    impl BlockStore for FlakyStore {
        async fn read_block(&mut self, piece: u32, offset: u32, len: u32) -> Result<Bytes> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(anyhow::anyhow!("disk went away"));
            }
            self.inner.read_block(piece, offset, len).await
        }

        async fn write_block(&mut self, piece: u32, offset: u32, data: &[u8]) -> Result<()> {
            self.inner.write_block(piece, offset, data).await
        }

        fn storage_type(&self) -> crate::storage::backend::StorageType {
            self.inner.storage_type()
        }
    }

    #[tokio::test]
    async fn test_failed_validation_read_leaves_piece_downloadable() {
        let data = content(2 * 16384);
        let torrent = TorrentInfo::for_content("t", 32768, &data);
        let mut store = PieceStore::new(&torrent);
        let mut blocks = FlakyStore {
            inner: MemoryBlockStore::new(&torrent),
            failures: 1,
        };

        store.store_block(&mut blocks, 0, 0, &data[..16384], SessionId(1)).await.unwrap();
        let err = store
            .store_block(&mut blocks, 0, 16384, &data[16384..], SessionId(2))
            .await
            .unwrap_err();
        let storage = err.downcast_ref::<TorrentError>().unwrap();
        assert!(matches!(storage, TorrentError::StorageError { .. }));
        assert!(storage.to_string().contains("validating piece 0"));

        assert_eq!(store.piece_state(0), Some(PieceState::Pending));
        assert_eq!(store.unassigned_blocks(0).count(), 2);
        assert!(!store.all_needed_assigned());
        assert_eq!(store.bytes_remaining(), 32768);

        store.store_block(&mut blocks, 0, 0, &data[..16384], SessionId(3)).await.unwrap();
        let outcome = store
            .store_block(&mut blocks, 0, 16384, &data[16384..], SessionId(3))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            BlockOutcome::Accepted {
                cancel: vec![],
                validation: Some(Validation::Valid),
            }
        );
        assert!(store.is_complete());
        assert_eq!(store.validations(), 2);
    }

    #[tokio::test]
    async fn test_first_copy_wins_and_cancels_duplicates() {
        let (_, mut store, mut blocks, data) = setup(16384);
        let key = BlockKey::new(0, 0);
        store.assign(key, SessionId(1));
        store.assign(key, SessionId(2));
        store.assign(key, SessionId(3));
        assert_eq!(store.assignees(key).len(), 3);

        let outcome = store.store_block(&mut blocks, 0, 0, &data, SessionId(2)).await.unwrap();
        match outcome {
            BlockOutcome::Accepted { cancel, validation } => {
                assert_eq!(cancel, vec![SessionId(1), SessionId(3)]);
                assert_eq!(validation, Some(Validation::Valid));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(store.assignees(key).is_empty());

        let late = store.store_block(&mut blocks, 0, 0, &data, SessionId(1)).await.unwrap();
        assert_eq!(late, BlockOutcome::Duplicate);
    }

    #[test]
    fn test_release_peer_returns_blocks_to_unassigned() {
        let (_, mut store, _, _) = setup(2 * 16384);
        store.assign(BlockKey::new(0, 0), SessionId(1));
        store.assign(BlockKey::new(1, 0), SessionId(1));
        store.assign(BlockKey::new(1, 0), SessionId(2));
        assert!(store.is_partial(0));

        let released = store.release_peer(SessionId(1));
        assert_eq!(released.len(), 2);
        assert_eq!(store.unassigned_blocks(0).count(), 1);
        assert_eq!(store.piece_state(0), Some(PieceState::Pending));
        assert_eq!(store.assignees(BlockKey::new(1, 0)), &[SessionId(2)]);
    }

    #[test]
    fn test_all_needed_assigned() {
        let (_, mut store, _, _) = setup(16384 + 100);
        assert!(!store.all_needed_assigned());
        store.assign(BlockKey::new(0, 0), SessionId(1));
        assert!(!store.all_needed_assigned());
        store.assign(BlockKey::new(1, 0), SessionId(1));
        assert!(store.all_needed_assigned());
    }

    #[test]
    fn test_check_request_bounds() {
        let (_, store, _, _) = setup(16384 + 100);
        assert!(store.check_request(0, 0, 16384, 131072).is_ok());
        assert!(store.check_request(1, 0, 100, 131072).is_ok());
        assert!(store.check_request(1, 50, 100, 131072).is_err());
        assert!(store.check_request(2, 0, 1, 131072).is_err());
        assert!(store.check_request(0, 0, 200_000, 131072).is_err());
    }

    #[tokio::test]
    async fn test_malformed_block_is_violation() {
        let (_, mut store, mut blocks, _) = setup(16384);
        assert!(store.store_block(&mut blocks, 0, 100, &[0u8; 10], SessionId(1)).await.is_err());
        assert!(store.store_block(&mut blocks, 0, 0, &[0u8; 10], SessionId(1)).await.is_err());
        assert!(store.store_block(&mut blocks, 5, 0, &[0u8; 10], SessionId(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_verify_existing_marks_present_pieces() {
        let data = content(2 * 16384);
        let torrent = TorrentInfo::for_content("t", 16384, &data);
        let mut store = PieceStore::new(&torrent);
        let mut partial = data.clone();
        partial[20000] ^= 0xFF;
        let mut blocks = MemoryBlockStore::with_content(16384, partial);

        assert_eq!(store.verify_existing(&mut blocks).await.unwrap(), 1);
        assert!(store.have().get(0));
        assert!(!store.have().get(1));
        assert_eq!(store.bytes_remaining(), 16384);
        assert!(store.has_block(BlockKey::new(0, 0)));
    }
}
