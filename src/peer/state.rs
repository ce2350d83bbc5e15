//! Peer state module
//!
//! One [`PeerSession`] per connection: choke/interest flags, the peer's
//! advertised pieces, request queues in both directions, rate meters,
//! bandwidth allowances and timers. Sessions are owned by the swarm's
//! controller task and are mutated only from there.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::TorrentError;
use crate::protocol::Message;
use crate::scheduler::bandwidth::{Allowance, RateMeter};
use crate::storage::bitfield::BitField;

/// Identifier of a session, unique within a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// TCP connect in progress
    #[default]
    Connecting,
    /// Waiting for the remote handshake
    Handshaking,
    /// Handshakes exchanged; messages flow
    Established,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Check if the session is usable for messages
    pub fn is_established(&self) -> bool {
        matches!(self, SessionState::Established)
    }
}

/// Information about a peer address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    pub source: PeerSource,
}

/// Where the peer was discovered from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PeerSource {
    Tracker,
    DHT,
    Incoming,
    Manual,
}

impl PeerInfo {
    /// Create a new peer info
    pub fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            addr,
            peer_id: None,
            source,
        }
    }

    /// Get the peer ID as a hex string
    pub fn peer_id_hex(&self) -> Option<String> {
        self.peer_id.map(hex::encode)
    }
}

/// One requested block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self { piece, offset, length }
    }

    pub fn to_request(self) -> Message {
        Message::Request { index: self.piece, begin: self.offset, length: self.length }
    }

    pub fn to_cancel(self) -> Message {
        Message::Cancel { index: self.piece, begin: self.offset, length: self.length }
    }
}

/// Per-connection protocol state
#[derive(Debug)]
pub struct PeerSession {
    pub id: SessionId,
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub peer_id: Option<[u8; 20]>,
    pub state: SessionState,
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
    /// Pieces the peer advertises
    pub pieces: BitField,
    /// Requests we sent, oldest first
    pub sent_requests: VecDeque<(BlockRequest, Instant)>,
    /// Requests the peer sent us, oldest first
    pub received_requests: VecDeque<BlockRequest>,
    pub download: RateMeter,
    pub upload: RateMeter,
    pub download_allowance: Allowance,
    pub upload_allowance: Allowance,
    pub connected_at: Instant,
    pub last_received: Instant,
    pub last_sent: Instant,
    /// Another session already uses this peer id; pruned on the next tick
    pub duplicate: bool,
    pub hash_failures: u32,
    /// Set once the bitfield (or first have) window has passed
    bitfield_allowed: bool,
    /// Messages queued for the writer
    pub outbox: VecDeque<Message>,
}

impl PeerSession {
    /// Create a session in the Connecting state
    pub fn new(id: SessionId, addr: SocketAddr, source: PeerSource, piece_count: usize, now: Instant) -> Self {
        Self {
            id,
            addr,
            source,
            peer_id: None,
            state: SessionState::Connecting,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            pieces: BitField::new(piece_count),
            sent_requests: VecDeque::new(),
            received_requests: VecDeque::new(),
            download: RateMeter::default(),
            upload: RateMeter::default(),
            download_allowance: Allowance::unlimited(),
            upload_allowance: Allowance::unlimited(),
            connected_at: now,
            last_received: now,
            last_sent: now,
            duplicate: false,
            hash_failures: 0,
            bitfield_allowed: true,
            outbox: VecDeque::new(),
        }
    }

    /// Move to a new lifecycle state
    pub fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("{} {}: {:?} -> {:?}", self.id, self.addr, self.state, state);
            self.state = state;
        }
    }

    /// Queue a message for sending
    pub fn send(&mut self, message: Message, now: Instant) {
        trace!("{} <- {:?}", self.id, message.message_id());
        self.last_sent = now;
        self.outbox.push_back(message);
    }

    /// Take every queued message
    pub fn drain_outbox(&mut self) -> Vec<Message> {
        self.outbox.drain(..).collect()
    }

    /// Check if we can request from peer
    pub fn can_request(&self) -> bool {
        self.state.is_established() && !self.peer_choking && self.am_interested
    }

    /// Whether the peer holds every piece
    pub fn is_seed(&self) -> bool {
        self.pieces.all_set()
    }

    /// Change our choke flag, queueing the message when it flips
    pub fn set_choking(&mut self, choke: bool, now: Instant) {
        if self.am_choking == choke {
            return;
        }
        self.am_choking = choke;
        if choke {
            // Pending uploads are dropped when choking
            self.received_requests.clear();
            self.send(Message::Choke, now);
        } else {
            self.send(Message::Unchoke, now);
        }
    }

    /// Change our interest flag, queueing the message when it flips
    pub fn set_interested(&mut self, interested: bool, now: Instant) {
        if self.am_interested == interested {
            return;
        }
        self.am_interested = interested;
        self.send(if interested { Message::Interested } else { Message::NotInterested }, now);
    }

    /// Apply a `bitfield` message; only legal as the first message
    pub fn apply_bitfield(&mut self, payload: &[u8]) -> Result<()> {
        if !self.bitfield_allowed {
            return Err(TorrentError::protocol_violation_field("Bitfield after first message", "bitfield").into());
        }
        self.pieces = BitField::from_bytes(payload, self.pieces.len())?;
        self.bitfield_allowed = false;
        Ok(())
    }

    /// Apply a `have` message, returning whether the piece is new for this peer
    pub fn apply_have(&mut self, piece: u32) -> Result<bool> {
        if piece as usize >= self.pieces.len() {
            return Err(TorrentError::protocol_violation_field(
                format!("Have for piece {} of {}", piece, self.pieces.len()),
                "piece_index",
            ).into());
        }
        Ok(self.pieces.set(piece as usize, true))
    }

    /// Note that a message arrived
    pub fn touch(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Any message other than bitfield closes the bitfield window
    pub fn close_bitfield_window(&mut self) {
        self.bitfield_allowed = false;
    }

    /// Record an outgoing request
    pub fn push_request(&mut self, request: BlockRequest, now: Instant) {
        self.sent_requests.push_back((request, now));
        self.send(request.to_request(), now);
    }

    /// Whether `request` is outstanding to this peer
    pub fn has_requested(&self, request: &BlockRequest) -> bool {
        self.sent_requests.iter().any(|(r, _)| r == request)
    }

    /// Remove an outstanding request matching a received block
    pub fn complete_request(&mut self, piece: u32, offset: u32) -> Option<BlockRequest> {
        let pos = self
            .sent_requests
            .iter()
            .position(|(r, _)| r.piece == piece && r.offset == offset)?;
        self.sent_requests.remove(pos).map(|(r, _)| r)
    }

    /// Withdraw a request we sent, queueing a `cancel`
    pub fn cancel_request(&mut self, request: &BlockRequest, now: Instant) -> bool {
        match self.sent_requests.iter().position(|(r, _)| r == request) {
            Some(pos) => {
                self.sent_requests.remove(pos);
                self.send(request.to_cancel(), now);
                true
            }
            None => false,
        }
    }

    /// Apply a `cancel` from the peer; removes the queued upload if present
    pub fn apply_cancel(&mut self, request: &BlockRequest) -> bool {
        let before = self.received_requests.len();
        self.received_requests.retain(|r| r != request);
        before != self.received_requests.len()
    }

    /// Drop our requests older than `timeout`, returning them
    pub fn expire_requests(&mut self, now: Instant, timeout: Duration) -> Vec<BlockRequest> {
        let mut expired = Vec::new();
        self.sent_requests.retain(|(r, at)| {
            let stale = now.saturating_duration_since(*at) >= timeout;
            if stale {
                expired.push(*r);
            }
            !stale
        });
        expired
    }

    /// Forget all requests we sent (e.g. on being choked)
    pub fn clear_sent_requests(&mut self) -> Vec<BlockRequest> {
        self.sent_requests.drain(..).map(|(r, _)| r).collect()
    }

    /// Throughput used for choking decisions
    pub fn ranking_rate(&mut self, seeding: bool, now: Instant) -> f64 {
        if seeding {
            self.upload.rate(now)
        } else {
            self.download.rate(now)
        }
    }

    /// Get peer statistics
    pub fn stats(&self) -> PeerStats {
        PeerStats {
            addr: self.addr,
            peer_id: self.peer_id,
            state: self.state,
            am_choking: self.am_choking,
            am_interested: self.am_interested,
            peer_choking: self.peer_choking,
            peer_interested: self.peer_interested,
            pieces: self.pieces.count_set(),
            downloaded: self.download.total(),
            uploaded: self.upload.total(),
        }
    }
}

/// Peer statistics snapshot
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    pub state: SessionState,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub pieces: usize,
    pub downloaded: u64,
    pub uploaded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> PeerSession {
        let mut s = PeerSession::new(SessionId(1), "127.0.0.1:6881".parse().unwrap(), PeerSource::Manual, 10, Instant::now());
        s.set_state(SessionState::Established);
        s
    }

    #[test]
    fn test_initial_flags() {
        let s = session();
        assert!(s.am_choking);
        assert!(s.peer_choking);
        assert!(!s.am_interested);
        assert!(!s.peer_interested);
        assert!(!s.can_request());
    }

    #[test]
    fn test_duplicate_have_counts_once() {
        let mut s = session();
        assert!(s.apply_have(3).unwrap());
        assert!(!s.apply_have(3).unwrap());
        assert_eq!(s.pieces.count_set(), 1);
        assert!(s.apply_have(10).is_err());
    }

    #[test]
    fn test_bitfield_only_first() {
        let mut s = session();
        s.apply_bitfield(&[0xFF, 0xC0]).unwrap();
        assert!(s.is_seed());
        assert!(s.apply_bitfield(&[0xFF, 0xC0]).is_err());
    }

    #[test]
    fn test_choke_flip_queues_once_and_drops_uploads() {
        let now = Instant::now();
        let mut s = session();
        s.set_choking(false, now);
        s.set_choking(false, now);
        s.received_requests.push_back(BlockRequest::new(0, 0, 16384));
        s.set_choking(true, now);
        assert!(s.received_requests.is_empty());
        assert_eq!(s.drain_outbox(), vec![Message::Unchoke, Message::Choke]);
    }

    #[test]
    fn test_request_lifecycle() {
        let now = Instant::now();
        let mut s = session();
        let a = BlockRequest::new(1, 0, 16384);
        let b = BlockRequest::new(1, 16384, 16384);
        s.push_request(a, now);
        s.push_request(b, now + Duration::from_secs(30));

        assert_eq!(s.complete_request(1, 0), Some(a));
        assert!(s.has_requested(&b));

        let expired = s.expire_requests(now + Duration::from_secs(95), Duration::from_secs(60));
        assert_eq!(expired, vec![b]);
        assert!(!s.cancel_request(&b, now));
    }

    #[test]
    fn test_apply_cancel() {
        let mut s = session();
        let r = BlockRequest::new(2, 0, 16384);
        s.received_requests.push_back(r);
        assert!(s.apply_cancel(&r));
        assert!(!s.apply_cancel(&r));
    }
}
