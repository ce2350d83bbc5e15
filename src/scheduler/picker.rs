//! Piece selection
//!
//! Tracks how many connected peers advertise each piece and picks blocks to
//! request: continue partial pieces first, then rarest-first, then (once every
//! needed block has a downloader) duplicate requests in end-game.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::peer::PeerSession;
use crate::storage::bitfield::BitField;
use crate::storage::piece::{BlockKey, PieceStore};

/// Blocks chosen for one peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Picks {
    pub blocks: Vec<BlockKey>,
    /// Blocks were taken from other peers' outstanding requests
    pub endgame: bool,
}

/// Availability counts and selection policy
#[derive(Debug, Clone)]
pub struct PiecePicker {
    availability: Vec<u32>,
}

impl PiecePicker {
    pub fn new(piece_count: usize) -> Self {
        Self {
            availability: vec![0; piece_count],
        }
    }

    /// Number of connected peers advertising `piece`
    pub fn availability(&self, piece: u32) -> u32 {
        self.availability.get(piece as usize).copied().unwrap_or(0)
    }

    /// Count every piece in a peer's bitfield
    pub fn add_bitfield(&mut self, pieces: &BitField) {
        for piece in pieces.iter_set() {
            self.availability[piece] += 1;
        }
    }

    /// Uncount a departing peer's pieces
    pub fn remove_bitfield(&mut self, pieces: &BitField) {
        for piece in pieces.iter_set() {
            self.availability[piece] = self.availability[piece].saturating_sub(1);
        }
    }

    /// Count a piece newly announced with `have`
    pub fn add_have(&mut self, piece: u32) {
        if let Some(count) = self.availability.get_mut(piece as usize) {
            *count += 1;
        }
    }

    /// Choose up to `max` blocks to request from `peer`
    pub fn pick(&self, store: &PieceStore, peer: &PeerSession, max: usize) -> Picks {
        let mut picks = Picks::default();
        if max == 0 {
            return picks;
        }
        let wanted = |piece: u32| peer.pieces.get(piece as usize) && !store.have().get(piece as usize);

        // Locality: pieces this peer is already serving, then any partial piece
        let mut serving: Vec<u32> = Vec::new();
        for (request, _) in &peer.sent_requests {
            if !serving.contains(&request.piece) {
                serving.push(request.piece);
            }
        }
        let mut partial: Vec<u32> = (0..store.piece_count() as u32)
            .filter(|&p| store.is_partial(p) && !serving.contains(&p))
            .collect();
        partial.sort_by_key(|&p| self.availability(p));

        for piece in serving.into_iter().chain(partial) {
            if !wanted(piece) {
                continue;
            }
            picks.blocks.extend(store.unassigned_blocks(piece).take(max - picks.blocks.len()));
            if picks.blocks.len() >= max {
                return picks;
            }
        }

        // Rarest first among untouched pieces, random among equals
        let mut fresh: Vec<u32> = (0..store.piece_count() as u32)
            .filter(|&p| wanted(p) && !store.is_partial(p))
            .collect();
        fresh.shuffle(&mut rand::thread_rng());
        fresh.sort_by_key(|&p| self.availability(p));

        for piece in fresh {
            picks.blocks.extend(store.unassigned_blocks(piece).take(max - picks.blocks.len()));
            if picks.blocks.len() >= max {
                return picks;
            }
        }

        if !picks.blocks.is_empty() || !store.all_needed_assigned() {
            return picks;
        }

        // End-game: duplicate blocks already outstanding elsewhere
        let mine: HashSet<(u32, u32)> = peer.sent_requests.iter().map(|(r, _)| (r.piece, r.offset)).collect();
        for piece in 0..store.piece_count() as u32 {
            if !wanted(piece) {
                continue;
            }
            for key in store.missing_blocks(piece) {
                if !mine.contains(&(key.piece, key.offset())) {
                    picks.blocks.push(key);
                    if picks.blocks.len() >= max {
                        break;
                    }
                }
            }
            if picks.blocks.len() >= max {
                break;
            }
        }

        if !picks.blocks.is_empty() {
            picks.endgame = true;
            debug!("End-game: {} duplicate blocks for {}", picks.blocks.len(), peer.id);
        }
        trace!("Picked {} blocks for {}", picks.blocks.len(), peer.id);
        picks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{BlockRequest, PeerSource, SessionId, SessionState};
    use crate::torrent::TorrentInfo;
    use std::time::Instant;

    fn store(pieces: usize, piece_length: u64) -> PieceStore {
        let content = vec![0u8; pieces * piece_length as usize];
        PieceStore::new(&TorrentInfo::for_content("p", piece_length, &content))
    }

    fn peer(id: u64, pieces: usize, has: &[usize]) -> PeerSession {
        let mut s = PeerSession::new(SessionId(id), "10.0.0.1:1".parse().unwrap(), PeerSource::Manual, pieces, Instant::now());
        s.set_state(SessionState::Established);
        for &p in has {
            s.pieces.set(p, true);
        }
        s
    }

    #[test]
    fn test_rarest_first() {
        let store = store(3, 16384);
        let mut picker = PiecePicker::new(3);
        let a = peer(1, 3, &[0, 1, 2]);
        let b = peer(2, 3, &[0, 1]);
        let c = peer(3, 3, &[0]);
        for p in [&a, &b, &c] {
            picker.add_bitfield(&p.pieces);
        }
        assert_eq!(picker.availability(0), 3);
        assert_eq!(picker.availability(2), 1);

        let picks = picker.pick(&store, &a, 1);
        assert_eq!(picks.blocks, vec![BlockKey::new(2, 0)]);
        assert!(!picks.endgame);
    }

    #[test]
    fn test_locality_prefers_partial_piece_from_same_peer() {
        let mut store = store(3, 65536);
        let mut picker = PiecePicker::new(3);
        let mut a = peer(1, 3, &[0, 1, 2]);
        picker.add_bitfield(&a.pieces);
        picker.add_have(2);
        picker.add_have(2);

        // Piece 1 already has a block in flight from this peer
        store.assign(BlockKey::new(1, 0), a.id);
        a.sent_requests.push_back((BlockRequest::new(1, 0, 16384), Instant::now()));

        let picks = picker.pick(&store, &a, 2);
        assert_eq!(picks.blocks, vec![BlockKey::new(1, 1), BlockKey::new(1, 2)]);
    }

    #[test]
    fn test_remove_bitfield() {
        let mut picker = PiecePicker::new(2);
        let a = peer(1, 2, &[0, 1]);
        picker.add_bitfield(&a.pieces);
        picker.remove_bitfield(&a.pieces);
        assert_eq!(picker.availability(0), 0);
    }

    #[test]
    fn test_endgame_duplicates_only_when_all_assigned() {
        let mut store = store(1, 32768);
        let picker = PiecePicker::new(1);
        let mut a = peer(1, 1, &[0]);
        let b = peer(2, 1, &[0]);

        store.assign(BlockKey::new(0, 0), a.id);
        a.sent_requests.push_back((BlockRequest::new(0, 0, 16384), Instant::now()));

        // One block is still unassigned: normal pick, no duplicates
        let picks = picker.pick(&store, &b, 4);
        assert_eq!(picks.blocks, vec![BlockKey::new(0, 1)]);
        assert!(!picks.endgame);

        store.assign(BlockKey::new(0, 1), a.id);
        a.sent_requests.push_back((BlockRequest::new(0, 16384, 16384), Instant::now()));

        let picks = picker.pick(&store, &b, 4);
        assert!(picks.endgame);
        assert_eq!(picks.blocks, vec![BlockKey::new(0, 0), BlockKey::new(0, 1)]);

        // Never duplicates onto the peer that already has the request
        assert!(picker.pick(&store, &a, 4).blocks.is_empty());
    }

    #[test]
    fn test_nothing_wanted_from_peer_without_pieces() {
        let store = store(2, 16384);
        let picker = PiecePicker::new(2);
        let empty = peer(1, 2, &[]);
        assert!(picker.pick(&store, &empty, 8).blocks.is_empty());
    }
}
