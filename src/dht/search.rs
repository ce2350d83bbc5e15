//! Iterative lookups
//!
//! A search starts from the closest good nodes we know and walks towards the
//! target. After the first round it only queries candidates strictly closer
//! than the best responder so far; when every query is lost it may fall back
//! to the next unqueried candidate.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::dht::node::NodeId;
use crate::dht::routing::K;

/// Queries in flight per search
pub const ALPHA: usize = 3;

/// Lifetime of a search
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(185);

/// A query older than this stops counting against `ALPHA`; a late reply is
/// still accepted until the transaction expires
pub const SLOW_QUERY: Duration = Duration::from_secs(15);

/// Candidate list bound
pub const MAX_CANDIDATES: usize = 64;

/// What a search is looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    FindNode,
    /// Collect peers; announce ourselves on `announce_port` afterwards
    GetPeers { announce_port: Option<u16> },
}

#[derive(Debug, Clone)]
struct Candidate {
    id: NodeId,
    addr: SocketAddr,
    distance: NodeId,
    sent_at: Option<Instant>,
    responded: bool,
    failed: bool,
    token: Option<Vec<u8>>,
}

impl Candidate {
    fn in_flight(&self, now: Instant) -> bool {
        !self.responded
            && !self.failed
            && self.sent_at.map_or(false, |at| now.saturating_duration_since(at) < SLOW_QUERY)
    }
}

/// One iterative lookup
#[derive(Debug)]
pub struct Search {
    pub id: u64,
    pub target: NodeId,
    pub kind: SearchKind,
    started: Instant,
    candidates: Vec<Candidate>,
    best: Option<NodeId>,
    history: Vec<NodeId>,
    peers: HashSet<SocketAddr>,
    fresh_peers: Vec<SocketAddr>,
    seeded: bool,
}

impl Search {
    pub fn new(id: u64, target: NodeId, kind: SearchKind, now: Instant) -> Self {
        Self {
            id,
            target,
            kind,
            started: now,
            candidates: Vec::new(),
            best: None,
            history: Vec::new(),
            peers: HashSet::new(),
            fresh_peers: Vec::new(),
            seeded: false,
        }
    }

    /// Add nodes to consider, keeping the list sorted and bounded
    pub fn add_candidates(&mut self, nodes: impl IntoIterator<Item = (NodeId, SocketAddr)>) {
        for (id, addr) in nodes {
            if self.candidates.iter().any(|c| c.id == id) {
                continue;
            }
            self.candidates.push(Candidate {
                id,
                addr,
                distance: id.distance(&self.target),
                sent_at: None,
                responded: false,
                failed: false,
                token: None,
            });
        }
        self.candidates.sort_by_key(|c| c.distance);
        self.trim();
    }

    /// Record a node we already queried outside the candidate list
    pub fn add_contacted(&mut self, id: NodeId, addr: SocketAddr, now: Instant) {
        self.add_candidates([(id, addr)]);
        if let Some(c) = self.candidates.iter_mut().find(|c| c.id == id) {
            c.sent_at.get_or_insert(now);
        }
    }

    /// Drop the farthest candidates we have not talked to yet
    pub fn trim(&mut self) {
        while self.candidates.len() > MAX_CANDIDATES {
            match self.candidates.iter().rposition(|c| c.sent_at.is_none()) {
                Some(i) => {
                    self.candidates.remove(i);
                }
                None => break,
            }
        }
    }

    fn best_distance(&self) -> Option<NodeId> {
        self.best.map(|b| b.distance(&self.target))
    }

    /// Nodes to query now; marks them as sent
    pub fn next_queries(&mut self, now: Instant) -> Vec<(NodeId, SocketAddr)> {
        if self.is_expired(now) {
            return Vec::new();
        }

        let mut picked = Vec::new();
        if !self.seeded {
            // First round: the K closest starting nodes
            self.seeded = true;
            for c in self.candidates.iter_mut().take(K) {
                c.sent_at = Some(now);
                picked.push((c.id, c.addr));
            }
            return picked;
        }

        let in_flight = self.candidates.iter().filter(|c| c.in_flight(now)).count();
        let budget = ALPHA.saturating_sub(in_flight);
        let best = self.best_distance();
        for c in self.candidates.iter_mut() {
            if picked.len() >= budget {
                break;
            }
            if c.sent_at.is_none() && best.map_or(true, |b| c.distance < b) {
                c.sent_at = Some(now);
                picked.push((c.id, c.addr));
            }
        }

        // Everything closer is exhausted and nothing is pending: try alternates
        let responders = self.candidates.iter().filter(|c| c.responded).count();
        if picked.is_empty() && in_flight == 0 && responders < K {
            if let Some(c) = self.candidates.iter_mut().take(K * 2).find(|c| c.sent_at.is_none()) {
                trace!("Search {} falling back to {}", self.id, c.id);
                c.sent_at = Some(now);
                picked.push((c.id, c.addr));
            }
        }
        picked
    }

    /// Apply a reply from `from`
    pub fn on_response(
        &mut self,
        from: NodeId,
        nodes: &[(NodeId, SocketAddr)],
        values: &[SocketAddr],
        token: Option<Vec<u8>>,
    ) {
        if let Some(c) = self.candidates.iter_mut().find(|c| c.id == from) {
            c.responded = true;
            c.failed = false;
            c.token = token;
        } else {
            return;
        }

        let distance = from.distance(&self.target);
        if self.best_distance().map_or(true, |b| distance < b) {
            self.best = Some(from);
            self.history.push(from);
            trace!("Search {} best is now {}", self.id, from);
        }

        for peer in values {
            if self.peers.insert(*peer) {
                self.fresh_peers.push(*peer);
            }
        }
        self.add_candidates(nodes.iter().copied());
    }

    /// The query to `node` was lost
    pub fn on_failure(&mut self, node: NodeId) {
        if let Some(c) = self.candidates.iter_mut().find(|c| c.id == node) {
            c.failed = true;
        }
    }

    /// Whether the search is still waiting on `node`
    pub fn is_waiting_on(&self, node: &NodeId) -> bool {
        self.candidates
            .iter()
            .any(|c| &c.id == node && c.sent_at.is_some() && !c.responded && !c.failed)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= SEARCH_TIMEOUT
    }

    /// No query is pending and there is nothing left worth asking
    pub fn is_converged(&self) -> bool {
        if !self.seeded {
            return false;
        }
        let pending = self
            .candidates
            .iter()
            .any(|c| c.sent_at.is_some() && !c.responded && !c.failed);
        if pending {
            return false;
        }
        let best = self.best_distance();
        let closer_left = self
            .candidates
            .iter()
            .any(|c| c.sent_at.is_none() && best.map_or(true, |b| c.distance < b));
        let responders = self.candidates.iter().filter(|c| c.responded).count();
        let alternates_left =
            responders < K && self.candidates.iter().take(K * 2).any(|c| c.sent_at.is_none());
        !closer_left && !alternates_left
    }

    pub fn is_done(&self, now: Instant) -> bool {
        let done = self.is_expired(now) || self.is_converged();
        if done {
            debug!(
                "Search {} for {} done: {} peers, {} responders",
                self.id,
                self.target,
                self.peers.len(),
                self.candidates.iter().filter(|c| c.responded).count()
            );
        }
        done
    }

    /// Successive best responders, each strictly closer than the last
    pub fn best_history(&self) -> &[NodeId] {
        &self.history
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peers found since the last call
    pub fn take_new_peers(&mut self) -> Vec<SocketAddr> {
        std::mem::take(&mut self.fresh_peers)
    }

    /// Closest responders that handed us a token
    pub fn announce_targets(&self) -> Vec<(NodeId, SocketAddr, Vec<u8>)> {
        self.candidates
            .iter()
            .filter(|c| c.responded)
            .filter_map(|c| c.token.clone().map(|t| (c.id, c.addr, t)))
            .take(K)
            .collect()
    }
}
