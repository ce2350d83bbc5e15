//! DHT routing table module
//!
//! Nodes live in one id-keyed map. Buckets cover contiguous id-prefix ranges
//! and hold only ids; they start as a single bucket over the whole space and
//! split in two when a full bucket covers our own id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::dht::node::{Node, NodeId, NodeState, GOOD_WINDOW};

/// Maximum number of nodes per bucket
pub const K: usize = 8;

/// A bucket of up to K node ids sharing a prefix
#[derive(Debug, Clone)]
pub struct KBucket {
    pub prefix: NodeId,
    pub prefix_len: usize,
    pub nodes: Vec<NodeId>,
    pub last_changed: Instant,
}

impl KBucket {
    fn new(prefix: NodeId, prefix_len: usize, now: Instant) -> Self {
        Self {
            prefix,
            prefix_len,
            nodes: Vec::with_capacity(K),
            last_changed: now,
        }
    }

    /// Whether `id` falls inside this bucket's range
    pub fn covers(&self, id: &NodeId) -> bool {
        id.matches_prefix(&self.prefix, self.prefix_len)
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// How an address sighting relates to what we already knew
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    Known,
    New,
    /// The address used to carry another id; the node must be re-verified
    IdChanged,
}

/// Result of trying to place a node into a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    AlreadyPresent,
    /// A bad node was evicted to make room
    Replaced(NodeId),
    /// Bucket full; these questionable members should be pinged
    Full(Vec<NodeId>),
    Rejected,
}

/// Routing table
#[derive(Debug)]
pub struct RoutingTable {
    own_id: NodeId,
    buckets: Vec<KBucket>,
    nodes: HashMap<NodeId, Node>,
    by_addr: HashMap<SocketAddr, NodeId>,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(own_id: NodeId, now: Instant) -> Self {
        Self {
            own_id,
            buckets: vec![KBucket::new(NodeId([0u8; 20]), 0, now)],
            nodes: HashMap::new(),
            by_addr: HashMap::new(),
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn id_at(&self, addr: &SocketAddr) -> Option<NodeId> {
        self.by_addr.get(addr).copied()
    }

    /// Number of nodes held in buckets
    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of nodes known, in buckets or not
    pub fn known(&self) -> usize {
        self.nodes.len()
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|b| b.covers(id))
            .unwrap_or(self.buckets.len() - 1)
    }

    pub fn in_table(&self, id: &NodeId) -> bool {
        self.buckets[self.bucket_index(id)].nodes.contains(id)
    }

    /// Record that `id` was seen at `addr`, creating the node if needed
    pub fn observe(&mut self, id: NodeId, addr: SocketAddr, now: Instant) -> Sighting {
        if let Some(previous) = self.by_addr.get(&addr).copied() {
            if previous == id {
                return Sighting::Known;
            }
            let changes = self.remove(&previous).map_or(0, |n| n.id_changes);
            debug!("{} changed id {} -> {}", addr, previous, id);
            let mut node = Node::new(id, addr, now);
            node.id_changes = changes + 1;
            self.remove(&id);
            self.by_addr.insert(addr, id);
            self.nodes.insert(id, node);
            return Sighting::IdChanged;
        }

        if let Some(existing) = self.nodes.get(&id) {
            if existing.addr != addr {
                // Same id from a new address: keep the one we already trust
                if existing.is_verified() {
                    return Sighting::Known;
                }
                self.remove(&id);
            } else {
                return Sighting::Known;
            }
        }

        self.by_addr.insert(addr, id);
        self.nodes.insert(id, Node::new(id, addr, now));
        Sighting::New
    }

    /// Try to place a known node into its bucket, splitting as needed
    pub fn insert(&mut self, id: NodeId, now: Instant) -> InsertOutcome {
        if id == self.own_id {
            return InsertOutcome::Rejected;
        }
        match self.nodes.get(&id) {
            Some(node) if node.state(now) != NodeState::Bad => {}
            _ => return InsertOutcome::Rejected,
        }

        loop {
            let index = self.bucket_index(&id);
            let bucket = &self.buckets[index];
            if bucket.nodes.contains(&id) {
                return InsertOutcome::AlreadyPresent;
            }
            if !bucket.is_full() {
                let bucket = &mut self.buckets[index];
                bucket.nodes.push(id);
                bucket.last_changed = now;
                trace!("Node {} added to bucket {}", id, index);
                return InsertOutcome::Added;
            }
            if bucket.covers(&self.own_id) && bucket.prefix_len < 159 {
                self.split(index, now);
                continue;
            }

            let bad = bucket
                .nodes
                .iter()
                .copied()
                .find(|n| self.nodes.get(n).map_or(true, |node| node.state(now) == NodeState::Bad));
            if let Some(bad) = bad {
                let bucket = &mut self.buckets[index];
                bucket.nodes.retain(|n| *n != bad);
                bucket.nodes.push(id);
                bucket.last_changed = now;
                self.forget(&bad);
                debug!("Node {} replaced bad node {}", id, bad);
                return InsertOutcome::Replaced(bad);
            }

            let questionable = bucket
                .nodes
                .iter()
                .copied()
                .filter(|n| self.nodes.get(n).map_or(false, |node| node.state(now) == NodeState::Questionable))
                .collect();
            return InsertOutcome::Full(questionable);
        }
    }

    fn split(&mut self, index: usize, now: Instant) {
        let old = self.buckets.remove(index);
        let len = old.prefix_len + 1;
        let mut low_prefix = old.prefix;
        low_prefix.set_bit(old.prefix_len, false);
        let mut high_prefix = old.prefix;
        high_prefix.set_bit(old.prefix_len, true);

        let mut low = KBucket::new(low_prefix, len, now);
        let mut high = KBucket::new(high_prefix, len, now);
        for id in old.nodes {
            if id.bit(old.prefix_len) {
                high.nodes.push(id);
            } else {
                low.nodes.push(id);
            }
        }
        debug!(
            "Split bucket at depth {} ({} low / {} high)",
            old.prefix_len,
            low.len(),
            high.len()
        );
        self.buckets.insert(index, high);
        self.buckets.insert(index, low);
    }

    /// Drop a node from its bucket, leaving it in the node map
    pub fn evict(&mut self, id: &NodeId) {
        let index = self.bucket_index(id);
        self.buckets[index].nodes.retain(|n| n != id);
    }

    /// Forget a node entirely
    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        self.evict(id);
        self.forget(id)
    }

    fn forget(&mut self, id: &NodeId) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        if self.by_addr.get(&node.addr) == Some(id) {
            self.by_addr.remove(&node.addr);
        }
        Some(node)
    }

    /// Up to `count` table members closest to `target`
    pub fn closest(&self, target: &NodeId, count: usize, now: Instant, good_only: bool) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter().copied())
            .filter(|id| {
                self.nodes.get(id).map_or(false, |n| match n.state(now) {
                    NodeState::Good => true,
                    NodeState::Questionable => !good_only,
                    NodeState::Bad => false,
                })
            })
            .collect();
        ids.sort_by_key(|id| id.distance(target));
        ids.truncate(count);
        ids
    }

    /// Table members that should be pinged
    pub fn questionable(&self, now: Instant) -> Vec<NodeId> {
        self.table_nodes()
            .filter(|n| n.state(now) == NodeState::Questionable)
            .map(|n| n.id)
            .collect()
    }

    /// Remove bad nodes from the table. Returns how many were dropped.
    pub fn evict_bad(&mut self, now: Instant) -> usize {
        let bad: Vec<NodeId> = self
            .table_nodes()
            .filter(|n| n.state(now) == NodeState::Bad)
            .map(|n| n.id)
            .collect();
        for id in &bad {
            self.remove(id);
        }
        bad.len()
    }

    /// Forget idle nodes that are not in a bucket and not wanted by `keep`
    pub fn purge_candidates(&mut self, now: Instant, keep: impl Fn(&NodeId) -> bool) -> usize {
        let stale: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| now.saturating_duration_since(n.last_contact()) >= GOOD_WINDOW)
            .map(|n| n.id)
            .filter(|id| !self.in_table(id) && !keep(id))
            .collect();
        for id in &stale {
            self.forget(id);
        }
        stale.len()
    }

    /// Random targets inside buckets untouched for `idle`, marking them refreshed
    pub fn refresh_targets(&mut self, now: Instant, idle: Duration) -> Vec<NodeId> {
        self.buckets
            .iter_mut()
            .filter(|b| now.saturating_duration_since(b.last_changed) >= idle)
            .map(|b| {
                b.last_changed = now;
                NodeId::random_in_prefix(&b.prefix, b.prefix_len)
            })
            .collect()
    }

    /// Mark the bucket covering `id` as recently active
    pub fn touch(&mut self, id: &NodeId, now: Instant) {
        let index = self.bucket_index(id);
        if self.buckets[index].nodes.contains(id) {
            self.buckets[index].last_changed = now;
        }
    }

    /// Every known node id, in buckets or not
    pub fn all_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Nodes held in buckets
    pub fn table_nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter_map(|id| self.nodes.get(id))
    }

    /// Re-key the table around a new local id
    pub fn rebuild(&mut self, own_id: NodeId, now: Instant) {
        let members: Vec<NodeId> = self.buckets.iter().flat_map(|b| b.nodes.iter().copied()).collect();
        self.own_id = own_id;
        self.buckets = vec![KBucket::new(NodeId([0u8; 20]), 0, now)];
        self.remove(&own_id);
        for id in members {
            self.insert(id, now);
        }
        debug!("Routing table rebuilt for {} ({} nodes)", own_id, self.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first(byte: u8, tail: u8) -> NodeId {
        let mut id = [0u8; 20];
        id[0] = byte;
        id[19] = tail;
        NodeId(id)
    }

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 6881))
    }

    fn add_good(table: &mut RoutingTable, id: NodeId, a: SocketAddr, now: Instant) -> InsertOutcome {
        table.observe(id, a, now);
        table.node_mut(&id).unwrap().on_response(now);
        table.insert(id, now)
    }

    #[test]
    fn test_routing_table_new() {
        let table = RoutingTable::new(NodeId::random(), Instant::now());
        assert_eq!(table.buckets().len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_full_bucket_with_own_prefix_splits() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId([0u8; 20]), now);
        for i in 0..8u8 {
            assert_eq!(add_good(&mut table, id_with_first(0x80, i), addr(i + 1), now), InsertOutcome::Added);
        }
        assert_eq!(table.buckets().len(), 1);

        let closer = id_with_first(0x01, 9);
        assert_eq!(add_good(&mut table, closer, addr(50), now), InsertOutcome::Added);

        assert_eq!(table.buckets().len(), 2);
        let home = table.buckets().iter().find(|b| b.nodes.contains(&closer)).unwrap();
        assert_eq!(home.prefix_len, 1);
        assert!(!home.prefix.bit(0));
        assert_eq!(home.len(), 1);
        let far = table.buckets().iter().find(|b| b.prefix.bit(0)).unwrap();
        assert_eq!(far.len(), 8);
        assert_eq!(table.len(), 9);
    }

    #[test]
    fn test_far_bucket_does_not_split() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId([0u8; 20]), now);
        for i in 0..8u8 {
            add_good(&mut table, id_with_first(0x80, i), addr(i + 1), now);
        }
        add_good(&mut table, id_with_first(0x01, 0), addr(40), now);

        // Bucket "1..." does not cover our id and is full of good nodes
        let outcome = add_good(&mut table, id_with_first(0xC0, 1), addr(41), now);
        assert_eq!(outcome, InsertOutcome::Full(vec![]));
        assert_eq!(table.buckets().len(), 2);
    }

    #[test]
    fn test_bad_node_is_replaced() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId([0u8; 20]), now);
        for i in 0..8u8 {
            add_good(&mut table, id_with_first(0x80, i), addr(i + 1), now);
        }
        add_good(&mut table, id_with_first(0x01, 0), addr(40), now);

        let victim = id_with_first(0x80, 3);
        table.node_mut(&victim).unwrap().on_timeout();
        table.node_mut(&victim).unwrap().on_timeout();

        let newcomer = id_with_first(0xC0, 1);
        assert_eq!(add_good(&mut table, newcomer, addr(41), now), InsertOutcome::Replaced(victim));
        assert!(table.in_table(&newcomer));
        assert!(table.node(&victim).is_none());
    }

    #[test]
    fn test_questionable_nodes_reported_when_full() {
        let now = Instant::now();
        let later = now + GOOD_WINDOW;
        let mut table = RoutingTable::new(NodeId([0u8; 20]), now);
        for i in 0..8u8 {
            add_good(&mut table, id_with_first(0x80, i), addr(i + 1), now);
        }
        add_good(&mut table, id_with_first(0x01, 0), addr(40), later);

        match add_good(&mut table, id_with_first(0xC0, 1), addr(41), later) {
            InsertOutcome::Full(ids) => assert_eq!(ids.len(), 8),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_closest_ordering() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId([0xFF; 20]), now);
        for i in 0..6u8 {
            add_good(&mut table, id_with_first(0, i), addr(i + 1), now);
        }
        let target = id_with_first(0, 4);
        let closest = table.closest(&target, 3, now, true);
        assert_eq!(closest[0], target);
        assert_eq!(closest.len(), 3);
        assert!(closest.windows(2).all(|w| w[0].distance(&target) < w[1].distance(&target)));
    }

    #[test]
    fn test_id_change_requires_reverification() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId::random(), now);
        let first = id_with_first(1, 1);
        add_good(&mut table, first, addr(1), now);

        let second = id_with_first(2, 2);
        assert_eq!(table.observe(second, addr(1), now), Sighting::IdChanged);
        assert!(table.node(&first).is_none());
        let node = table.node(&second).unwrap();
        assert!(!node.is_verified());
        assert_eq!(node.id_changes, 1);

        let third = id_with_first(3, 3);
        table.observe(third, addr(1), now);
        assert_eq!(table.node(&third).unwrap().state(now), NodeState::Bad);
        assert_eq!(table.insert(third, now), InsertOutcome::Rejected);
    }

    #[test]
    fn test_rebuild_keeps_members() {
        let now = Instant::now();
        let mut table = RoutingTable::new(NodeId([0u8; 20]), now);
        for i in 0..9u8 {
            add_good(&mut table, id_with_first(0x80 | i, i), addr(i + 1), now);
        }
        let before = table.len();
        table.rebuild(NodeId([0xFF; 20]), now);
        assert_eq!(table.own_id(), NodeId([0xFF; 20]));
        assert_eq!(table.len(), before);
    }
}
