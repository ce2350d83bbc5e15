//! DHT node module
//!
//! Node identifiers, XOR distance and per-node liveness bookkeeping.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A node is good while it answered us within this window
pub const GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Failed pings (or id reassignments) after which a node is bad
pub const MAX_FAILURES: u32 = 2;

/// DHT node identifier (20 bytes)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Create a new NodeId from bytes
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Generate a random NodeId
    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::thread_rng().fill(&mut id);
        Self(id)
    }

    /// Random id sharing the first `prefix_len` bits of `prefix`
    pub fn random_in_prefix(prefix: &NodeId, prefix_len: usize) -> Self {
        let mut id = Self::random();
        for bit in 0..prefix_len.min(160) {
            id.set_bit(bit, prefix.bit(bit));
        }
        id
    }

    /// Build from a slice that must be exactly 20 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let id: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(id))
    }

    /// Get the NodeId as bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Get the NodeId as a hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a NodeId from a hex string
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        hex::decode(hex_str).ok().and_then(|bytes| Self::from_slice(&bytes))
    }

    /// XOR distance; compares with `Ord` as a 160-bit big-endian number
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(out)
    }

    /// Bit `index`, counted from the most significant bit
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn set_bit(&mut self, index: usize, value: bool) {
        let mask = 0x80 >> (index % 8);
        if value {
            self.0[index / 8] |= mask;
        } else {
            self.0[index / 8] &= !mask;
        }
    }

    /// Whether the first `len` bits equal those of `prefix`
    pub fn matches_prefix(&self, prefix: &NodeId, len: usize) -> bool {
        (0..len).all(|i| self.bit(i) == prefix.bit(i))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Liveness classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Good,
    Questionable,
    Bad,
}

/// Tokens we issued to one node; the previous one stays valid for a rotation
#[derive(Debug, Clone, Default)]
pub struct TokenPair {
    pub current: Option<Vec<u8>>,
    pub previous: Option<Vec<u8>>,
}

impl TokenPair {
    /// Current token, issuing a fresh one if needed
    pub fn issue(&mut self) -> Vec<u8> {
        self.current
            .get_or_insert_with(|| {
                let mut token = vec![0u8; 8];
                rand::thread_rng().fill(&mut token[..]);
                token
            })
            .clone()
    }

    pub fn rotate(&mut self) {
        self.previous = self.current.take();
    }

    pub fn accepts(&self, token: &[u8]) -> bool {
        self.current.as_deref() == Some(token) || self.previous.as_deref() == Some(token)
    }
}

/// Represents a DHT node
#[derive(Debug, Clone)]
pub struct Node {
    /// Node identifier
    pub id: NodeId,
    /// Node address
    pub addr: SocketAddr,
    pub created: Instant,
    /// Last reply we received from the node
    pub last_response: Option<Instant>,
    /// Last query the node sent us
    pub last_query: Option<Instant>,
    /// Consecutive unanswered queries
    pub failed_pings: u32,
    /// Times this address showed up with a different id
    pub id_changes: u32,
    /// Tokens issued to the node
    pub tokens: TokenPair,
    /// Token the node gave us for announcing
    pub their_token: Option<Vec<u8>>,
}

impl Node {
    /// Create a new node
    pub fn new(id: NodeId, addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            addr,
            created: now,
            last_response: None,
            last_query: None,
            failed_pings: 0,
            id_changes: 0,
            tokens: TokenPair::default(),
            their_token: None,
        }
    }

    /// Classify the node at `now`
    pub fn state(&self, now: Instant) -> NodeState {
        if self.failed_pings >= MAX_FAILURES || self.id_changes >= MAX_FAILURES {
            return NodeState::Bad;
        }
        let recent = |at: Option<Instant>| at.map_or(false, |t| now.saturating_duration_since(t) < GOOD_WINDOW);
        // A node that ever replied stays good while it keeps querying us
        if recent(self.last_response) || (self.last_response.is_some() && recent(self.last_query)) {
            NodeState::Good
        } else {
            NodeState::Questionable
        }
    }

    pub fn is_good(&self, now: Instant) -> bool {
        self.state(now) == NodeState::Good
    }

    /// Whether the node has ever answered one of our queries
    pub fn is_verified(&self) -> bool {
        self.last_response.is_some()
    }

    pub fn on_response(&mut self, now: Instant) {
        self.last_response = Some(now);
        self.failed_pings = 0;
    }

    pub fn on_query(&mut self, now: Instant) {
        self.last_query = Some(now);
    }

    pub fn on_timeout(&mut self) {
        self.failed_pings += 1;
    }

    /// Most recent contact in either direction
    pub fn last_contact(&self) -> Instant {
        [self.last_response, self.last_query]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_hex() {
        let id = NodeId::random();
        assert_eq!(NodeId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(NodeId::from_hex("abcd"), None);
    }

    #[test]
    fn test_distance_ordering() {
        let zero = NodeId([0u8; 20]);
        let mut near = [0u8; 20];
        near[19] = 1;
        let mut far = [0u8; 20];
        far[0] = 0x80;
        assert!(zero.distance(&NodeId(near)) < zero.distance(&NodeId(far)));
        assert_eq!(NodeId(far).distance(&NodeId(far)), zero);
    }

    #[test]
    fn test_bits_and_prefix() {
        let mut id = NodeId([0u8; 20]);
        id.set_bit(0, true);
        id.set_bit(9, true);
        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(id.bit(9));
        assert_eq!(id.0[0], 0x80);
        assert_eq!(id.0[1], 0x40);

        let prefix = NodeId([0xAB; 20]);
        for _ in 0..20 {
            assert!(NodeId::random_in_prefix(&prefix, 12).matches_prefix(&prefix, 12));
        }
    }

    #[test]
    fn test_node_states() {
        let now = Instant::now();
        let mut node = Node::new(NodeId::random(), "10.0.0.1:6881".parse().unwrap(), now);
        assert_eq!(node.state(now), NodeState::Questionable);

        node.on_response(now);
        assert_eq!(node.state(now), NodeState::Good);
        assert_eq!(node.state(now + GOOD_WINDOW), NodeState::Questionable);

        node.on_query(now + GOOD_WINDOW);
        assert_eq!(node.state(now + GOOD_WINDOW), NodeState::Good);

        node.on_timeout();
        node.on_timeout();
        assert_eq!(node.state(now), NodeState::Bad);
    }

    #[test]
    fn test_token_rotation() {
        let mut tokens = TokenPair::default();
        let first = tokens.issue();
        assert_eq!(tokens.issue(), first);
        tokens.rotate();
        let second = tokens.issue();
        assert!(tokens.accepts(&first));
        assert!(tokens.accepts(&second));
        tokens.rotate();
        assert!(!tokens.accepts(&first));
        assert!(tokens.accepts(&second));
    }
}
