//! DHT main module
//!
//! Protocol state for one DHT node. Packets come in through
//! [`DHT::handle_packet`], time moves through [`DHT::tick`], and outgoing
//! datagrams and discoveries queue up for the owning task to drain. No I/O
//! happens here.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::dht::ip_vote::{id_for_ip, IpVoter, VoteOutcome};
use crate::dht::message::{
    generate_transaction_id, Body, DHTMessage, Query, QueryType, Response, ERROR_METHOD_UNKNOWN, ERROR_PROTOCOL,
};
use crate::dht::node::{NodeId, MAX_FAILURES};
use crate::dht::persist::DhtState;
use crate::dht::routing::{InsertOutcome, RoutingTable, Sighting, K};
use crate::dht::search::{Search, SearchKind};
use crate::error::TorrentError;

/// DHT timing and capacity settings
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Unanswered queries expire after this and count as a lost ping
    pub query_timeout: Duration,
    pub token_rotation: Duration,
    /// Buckets idle this long get a refresh lookup
    pub bucket_refresh: Duration,
    /// How long an announced peer is kept
    pub peer_ttl: Duration,
    pub max_peers_per_torrent: usize,
    /// Period of table housekeeping
    pub maintenance_interval: Duration,
    pub blacklist_duration: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(180),
            token_rotation: Duration::from_secs(5 * 60),
            bucket_refresh: Duration::from_secs(15 * 60),
            peer_ttl: Duration::from_secs(30 * 60),
            max_peers_per_torrent: 100,
            maintenance_interval: Duration::from_secs(60),
            blacklist_duration: Duration::from_secs(60 * 60),
        }
    }
}

/// Something the owner of the DHT should know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtEvent {
    /// New peers for an info-hash
    Peers { info_hash: [u8; 20], peers: Vec<SocketAddr> },
    /// A lookup finished
    SearchDone { target: NodeId, peers: usize },
    /// Our node id was regenerated
    IdChanged(NodeId),
}

/// Outstanding query
#[derive(Debug, Clone)]
pub struct Transaction {
    pub node: Option<NodeId>,
    pub addr: SocketAddr,
    pub query: QueryType,
    pub sent_at: Instant,
    pub search: Option<u64>,
}

/// Peers announced to us, per info-hash
#[derive(Debug, Default)]
struct PeerStore {
    by_hash: HashMap<[u8; 20], Vec<(SocketAddr, Instant)>>,
}

impl PeerStore {
    fn add(&mut self, info_hash: [u8; 20], peer: SocketAddr, now: Instant, max: usize) {
        let peers = self.by_hash.entry(info_hash).or_default();
        if let Some(entry) = peers.iter_mut().find(|(a, _)| *a == peer) {
            entry.1 = now;
            return;
        }
        if peers.len() >= max {
            if let Some(oldest) = peers.iter().enumerate().min_by_key(|(_, (_, at))| *at).map(|(i, _)| i) {
                peers.swap_remove(oldest);
            }
        }
        peers.push((peer, now));
    }

    fn get(&self, info_hash: &[u8; 20], now: Instant, ttl: Duration) -> Vec<SocketAddr> {
        self.by_hash
            .get(info_hash)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|(_, at)| now.saturating_duration_since(*at) < ttl)
                    .map(|(a, _)| *a)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn expire(&mut self, now: Instant, ttl: Duration) {
        self.by_hash.retain(|_, peers| {
            peers.retain(|(_, at)| now.saturating_duration_since(*at) < ttl);
            !peers.is_empty()
        });
    }
}

/// Main DHT struct
#[derive(Debug)]
pub struct DHT {
    config: DhtConfig,
    table: RoutingTable,
    transactions: HashMap<Vec<u8>, Transaction>,
    searches: HashMap<u64, Search>,
    next_search: u64,
    peers: PeerStore,
    voter: IpVoter,
    blacklist: HashMap<IpAddr, Instant>,
    outbox: VecDeque<(SocketAddr, Vec<u8>)>,
    events: VecDeque<DhtEvent>,
    last_rotation: Instant,
    last_maintenance: Instant,
}

impl DHT {
    /// Create a new DHT instance
    pub fn new(id: NodeId, config: DhtConfig, now: Instant) -> Self {
        info!("DHT initialized with ID: {}", id.to_hex());
        Self {
            config,
            table: RoutingTable::new(id, now),
            transactions: HashMap::new(),
            searches: HashMap::new(),
            next_search: 1,
            peers: PeerStore::default(),
            voter: IpVoter::default(),
            blacklist: HashMap::new(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            last_rotation: now,
            last_maintenance: now,
        }
    }

    /// Rebuild from saved state; stored nodes are pinged before they count as good
    pub fn from_state(state: &DhtState, config: DhtConfig, now: Instant) -> anyhow::Result<Self> {
        let mut dht = Self::new(state.node_id()?, config, now);
        let contacts = state.contacts();
        debug!("Restoring {} DHT nodes", contacts.len());
        for (id, addr) in contacts {
            dht.table.observe(id, addr, now);
            dht.table.insert(id, now);
            dht.send_query(addr, Some(id), Query::Ping, None, now);
        }
        Ok(dht)
    }

    /// Snapshot for persistence
    pub fn state(&self) -> DhtState {
        DhtState::new(self.id(), self.table.table_nodes().map(|n| (n.id, n.addr)))
    }

    pub fn id(&self) -> NodeId {
        self.table.own_id()
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn node_count(&self) -> usize {
        self.table.len()
    }

    pub fn active_searches(&self) -> usize {
        self.searches.len()
    }

    pub fn pending_queries(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_blacklisted(&self, ip: &IpAddr) -> bool {
        self.blacklist.contains_key(ip)
    }

    /// Datagrams ready to send
    pub fn drain_outbox(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.outbox.drain(..).collect()
    }

    pub fn drain_events(&mut self) -> Vec<DhtEvent> {
        self.events.drain(..).collect()
    }

    /// Locally stored peers for an info-hash
    pub fn stored_peers(&self, info_hash: &[u8; 20], now: Instant) -> Vec<SocketAddr> {
        self.peers.get(info_hash, now, self.config.peer_ttl)
    }

    fn send_query(&mut self, addr: SocketAddr, node: Option<NodeId>, query: Query, search: Option<u64>, now: Instant) {
        let Some(kind) = query.query_type() else {
            return;
        };
        let mut tid = generate_transaction_id();
        while self.transactions.contains_key(&tid) {
            tid = generate_transaction_id();
        }
        let message = DHTMessage::query(tid.clone(), self.id(), query);
        match message.serialize() {
            Ok(data) => {
                trace!("DHT {} -> {}", kind, addr);
                self.outbox.push_back((addr, data));
                self.transactions.insert(
                    tid,
                    Transaction {
                        node,
                        addr,
                        query: kind,
                        sent_at: now,
                        search,
                    },
                );
            }
            Err(e) => warn!("Failed to serialize DHT {}: {}", kind, e),
        }
    }

    fn send_reply(&mut self, addr: SocketAddr, message: DHTMessage) {
        match message.serialize() {
            Ok(data) => self.outbox.push_back((addr, data)),
            Err(e) => warn!("Failed to serialize DHT reply: {}", e),
        }
    }

    /// Ping an address
    pub fn ping(&mut self, addr: SocketAddr, now: Instant) {
        let node = self.table.id_at(&addr);
        self.send_query(addr, node, Query::Ping, None, now);
    }

    fn ping_node(&mut self, id: NodeId, now: Instant) {
        let pending = self
            .transactions
            .values()
            .any(|t| t.node == Some(id) && t.query == QueryType::Ping);
        if pending {
            return;
        }
        if let Some(addr) = self.table.node(&id).map(|n| n.addr) {
            self.send_query(addr, Some(id), Query::Ping, None, now);
        }
    }

    /// Join the network through nodes whose ids we do not know yet
    pub fn bootstrap(&mut self, addrs: &[SocketAddr], now: Instant) -> u64 {
        let target = self.id();
        let search = self.start_search(target, SearchKind::FindNode, now);
        info!("Bootstrapping DHT from {} nodes", addrs.len());
        for addr in addrs {
            self.send_query(*addr, None, Query::FindNode { target }, Some(search), now);
        }
        search
    }

    /// Look for peers of `info_hash`, announcing on `announce_port` when done
    pub fn get_peers(&mut self, info_hash: [u8; 20], announce_port: Option<u16>, now: Instant) -> u64 {
        self.start_search(NodeId(info_hash), SearchKind::GetPeers { announce_port }, now)
    }

    /// Look up the nodes closest to `target`
    pub fn find_node(&mut self, target: NodeId, now: Instant) -> u64 {
        self.start_search(target, SearchKind::FindNode, now)
    }

    /// Drop any peer search for `info_hash` without announcing.
    ///
    /// Replies still in flight are treated as unsolicited.
    pub fn cancel_search(&mut self, info_hash: [u8; 20]) -> bool {
        let target = NodeId(info_hash);
        let cancelled: Vec<u64> = self
            .searches
            .values()
            .filter(|s| s.target == target && matches!(s.kind, SearchKind::GetPeers { .. }))
            .map(|s| s.id)
            .collect();
        for id in &cancelled {
            self.searches.remove(id);
            self.transactions.retain(|_, t| t.search != Some(*id));
            debug!("Search {} for {} cancelled", id, target);
        }
        !cancelled.is_empty()
    }

    fn start_search(&mut self, target: NodeId, kind: SearchKind, now: Instant) -> u64 {
        if let Some(existing) = self.searches.values().find(|s| s.target == target && s.kind == kind) {
            return existing.id;
        }

        let id = self.next_search;
        self.next_search += 1;
        let mut search = Search::new(id, target, kind, now);

        let mut seeds = self.table.closest(&target, K, now, true);
        if seeds.is_empty() {
            seeds = self.table.closest(&target, K, now, false);
        }
        search.add_candidates(
            seeds
                .iter()
                .filter_map(|n| self.table.node(n).map(|node| (node.id, node.addr))),
        );
        debug!("Search {} for {} ({:?}) from {} nodes", id, target, kind, seeds.len());
        self.searches.insert(id, search);
        self.pump_search(id, now);
        id
    }

    fn pump_search(&mut self, id: u64, now: Instant) {
        let Some(search) = self.searches.get_mut(&id) else {
            return;
        };
        let query = match search.kind {
            SearchKind::FindNode => Query::FindNode { target: search.target },
            SearchKind::GetPeers { .. } => Query::GetPeers {
                info_hash: search.target.0,
            },
        };
        for (node, addr) in search.next_queries(now) {
            self.send_query(addr, Some(node), query.clone(), Some(id), now);
        }
    }

    /// Process one datagram from `from`
    pub fn handle_packet(&mut self, data: &[u8], from: SocketAddr, now: Instant) {
        if self.blacklist.contains_key(&from.ip()) {
            trace!("Dropping DHT packet from blacklisted {}", from);
            return;
        }
        let message = match DHTMessage::deserialize(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Bad DHT packet from {}: {}", from, e);
                return;
            }
        };

        let DHTMessage { transaction, body, ip } = message;
        match body {
            Body::Query { id, query } => self.handle_query(transaction, id, query, from, now),
            Body::Response(response) => self.handle_response(transaction, response, ip, from, now),
            Body::Error { code, message } => self.handle_error(transaction, code, &message, from, now),
        }
    }

    fn handle_query(&mut self, tid: Vec<u8>, id: NodeId, query: Query, from: SocketAddr, now: Instant) {
        if id == self.id() {
            return;
        }
        let sighting = self.table.observe(id, from, now);
        if sighting == Sighting::IdChanged && self.reject_id_churn(id, from, now) {
            return;
        }
        if let Some(node) = self.table.node_mut(&id) {
            node.on_query(now);
        }
        match sighting {
            Sighting::Known => self.table.touch(&id, now),
            // Unverified: learn whether it really answers at that address
            Sighting::New | Sighting::IdChanged => self.ping_node(id, now),
        }

        let own = self.id();
        let reply = match query {
            Query::Ping => DHTMessage::response(tid, Response::new(own), from),
            Query::FindNode { target } => {
                let mut response = Response::new(own);
                response.nodes = self.contacts_near(&target, now);
                DHTMessage::response(tid, response, from)
            }
            Query::GetPeers { info_hash } => {
                let mut response = Response::new(own);
                response.token = self.table.node_mut(&id).map(|n| n.tokens.issue());
                response.values = self.peers.get(&info_hash, now, self.config.peer_ttl);
                if response.values.is_empty() {
                    response.nodes = self.contacts_near(&NodeId(info_hash), now);
                }
                DHTMessage::response(tid, response, from)
            }
            Query::AnnouncePeer { info_hash, port, token, implied_port } => {
                let valid = self.table.node(&id).map_or(false, |n| n.tokens.accepts(&token));
                if !valid {
                    debug!("Rejecting announce from {}: bad token", from);
                    DHTMessage::error(tid, ERROR_PROTOCOL, "Bad token")
                } else {
                    let port = if implied_port { from.port() } else { port };
                    let peer = SocketAddr::new(from.ip(), port);
                    debug!("Peer {} announced for {}", peer, hex::encode(info_hash));
                    self.peers.add(info_hash, peer, now, self.config.max_peers_per_torrent);
                    DHTMessage::response(tid, Response::new(own), from)
                }
            }
            Query::Unknown(method) => {
                debug!("Unknown DHT method {:?} from {}", method, from);
                DHTMessage::error(tid, ERROR_METHOD_UNKNOWN, "Method Unknown")
            }
            Query::Malformed(reason) => {
                debug!("Malformed DHT query from {}: {}", from, reason);
                DHTMessage::error(tid, ERROR_PROTOCOL, reason)
            }
        };
        self.send_reply(from, reply);
    }

    /// Blacklist an address that keeps changing its id
    fn reject_id_churn(&mut self, id: NodeId, from: SocketAddr, now: Instant) -> bool {
        let churning = self.table.node(&id).map_or(false, |n| n.id_changes >= MAX_FAILURES);
        if churning {
            warn!("{} changed its node id too often, blacklisting", from);
            self.blacklist.insert(from.ip(), now);
            self.table.remove(&id);
        }
        churning
    }

    fn contacts_near(&self, target: &NodeId, now: Instant) -> Vec<(NodeId, SocketAddr)> {
        self.table
            .closest(target, K, now, false)
            .into_iter()
            .filter_map(|id| self.table.node(&id).map(|n| (n.id, n.addr)))
            .collect()
    }

    fn handle_response(
        &mut self,
        tid: Vec<u8>,
        response: Response,
        reported: Option<SocketAddr>,
        from: SocketAddr,
        now: Instant,
    ) {
        let Some(tx) = self.transactions.get(&tid) else {
            trace!("Unsolicited DHT reply from {}", from);
            return;
        };
        if tx.addr != from {
            debug!("DHT reply for {} came from {}", tx.addr, from);
            return;
        }
        let Some(tx) = self.transactions.remove(&tid) else {
            return;
        };
        let Some(id) = response.id else {
            self.fail_transaction(tx);
            return;
        };
        if id == self.id() {
            return;
        }

        let sighting = self.table.observe(id, from, now);
        if sighting == Sighting::IdChanged && self.reject_id_churn(id, from, now) {
            return;
        }
        if let Some(node) = self.table.node_mut(&id) {
            node.on_response(now);
            if response.token.is_some() {
                node.their_token = response.token.clone();
            }
        }
        if sighting == Sighting::IdChanged {
            self.ping_node(id, now);
        } else if let InsertOutcome::Full(questionable) = self.table.insert(id, now) {
            for q in questionable {
                self.ping_node(q, now);
            }
        }

        if let Some(reported) = reported {
            self.vote_external_ip(reported.ip(), from, now);
        }

        if let Some(search_id) = tx.search {
            if let Some(search) = self.searches.get_mut(&search_id) {
                if !search.is_waiting_on(&id) {
                    search.add_contacted(id, from, now);
                }
                search.on_response(id, &response.nodes, &response.values, response.token);
                let peers = search.take_new_peers();
                if !peers.is_empty() {
                    debug!("Search {} found {} new peers", search_id, peers.len());
                    self.events.push_back(DhtEvent::Peers {
                        info_hash: search.target.0,
                        peers,
                    });
                }
                self.pump_search(search_id, now);
            }
        }
    }

    fn handle_error(&mut self, tid: Vec<u8>, code: i64, message: &str, from: SocketAddr, now: Instant) {
        let Some(tx) = self.transactions.remove(&tid) else {
            return;
        };
        debug!("{}", TorrentError::dht_error_with_node(format!("error {}: {}", code, message), from.to_string()));
        // The node is alive even if it refused the query
        if let Some(node) = tx.node.and_then(|id| self.table.node_mut(&id)) {
            node.on_response(now);
        }
        if let (Some(search_id), Some(node)) = (tx.search, tx.node) {
            if let Some(search) = self.searches.get_mut(&search_id) {
                search.on_failure(node);
            }
            self.pump_search(search_id, now);
        }
    }

    fn fail_transaction(&mut self, tx: Transaction) {
        if let Some(id) = tx.node {
            if let Some(node) = self.table.node_mut(&id) {
                node.on_timeout();
            }
            if let Some(search) = tx.search.and_then(|s| self.searches.get_mut(&s)) {
                search.on_failure(id);
            }
        }
    }

    fn vote_external_ip(&mut self, reported: IpAddr, from: SocketAddr, now: Instant) {
        match self.voter.report(reported, from) {
            VoteOutcome::Spoof => {
                self.blacklist.insert(from.ip(), now);
                if let Some(id) = self.table.id_at(&from) {
                    self.table.remove(&id);
                }
            }
            VoteOutcome::Confirmed(ip) => {
                let id = id_for_ip(ip);
                info!("External address {} confirmed, new node id {}", ip, id);
                self.table.rebuild(id, now);
                self.events.push_back(DhtEvent::IdChanged(id));
            }
            VoteOutcome::Agrees | VoteOutcome::Pending => {}
        }
    }

    /// Advance timers: expire queries, drive searches, rotate tokens and
    /// run table maintenance
    pub fn tick(&mut self, now: Instant) {
        let expired: Vec<Vec<u8>> = self
            .transactions
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.sent_at) >= self.config.query_timeout)
            .map(|(tid, _)| tid.clone())
            .collect();
        for tid in expired {
            if let Some(tx) = self.transactions.remove(&tid) {
                trace!("DHT {} to {} timed out", tx.query, tx.addr);
                self.fail_transaction(tx);
            }
        }

        if now.saturating_duration_since(self.last_rotation) >= self.config.token_rotation {
            self.last_rotation = now;
            self.rotate_tokens();
        }

        let ids: Vec<u64> = self.searches.keys().copied().collect();
        for id in ids {
            self.pump_search(id, now);
            let outstanding = self.transactions.values().any(|t| t.search == Some(id));
            let done = self.searches.get(&id).map_or(false, |s| {
                s.is_expired(now) || (!outstanding && s.is_done(now))
            });
            if done {
                self.finish_search(id, now);
            }
        }

        if now.saturating_duration_since(self.last_maintenance) >= self.config.maintenance_interval {
            self.last_maintenance = now;
            self.maintain(now);
        }
    }

    fn rotate_tokens(&mut self) {
        trace!("Rotating DHT tokens");
        let ids: Vec<NodeId> = self.table_ids();
        for id in ids {
            if let Some(node) = self.table.node_mut(&id) {
                node.tokens.rotate();
            }
        }
    }

    fn table_ids(&self) -> Vec<NodeId> {
        self.table.all_ids()
    }

    fn finish_search(&mut self, id: u64, now: Instant) {
        let Some(search) = self.searches.remove(&id) else {
            return;
        };
        if let SearchKind::GetPeers { announce_port: Some(port) } = search.kind {
            let targets = search.announce_targets();
            debug!("Announcing {} on port {} to {} nodes", search.target, port, targets.len());
            for (node, addr, token) in targets {
                self.send_query(
                    addr,
                    Some(node),
                    Query::AnnouncePeer {
                        info_hash: search.target.0,
                        port,
                        token,
                        implied_port: false,
                    },
                    None,
                    now,
                );
            }
        }
        self.events.push_back(DhtEvent::SearchDone {
            target: search.target,
            peers: search.peer_count(),
        });
    }

    fn maintain(&mut self, now: Instant) {
        let evicted = self.table.evict_bad(now);
        if evicted > 0 {
            debug!("Evicted {} bad DHT nodes", evicted);
        }

        for id in self.table.questionable(now) {
            self.ping_node(id, now);
        }

        if !self.table.is_empty() {
            for target in self.table.refresh_targets(now, self.config.bucket_refresh) {
                trace!("Refreshing bucket around {}", target);
                self.find_node(target, now);
            }
        }

        let pending: Vec<NodeId> = self.transactions.values().filter_map(|t| t.node).collect();
        let searches = &self.searches;
        let purged = self
            .table
            .purge_candidates(now, |id| pending.contains(id) || searches.values().any(|s| s.is_waiting_on(id)));
        if purged > 0 {
            trace!("Forgot {} idle DHT contacts", purged);
        }

        self.peers.expire(now, self.config.peer_ttl);
        let ttl = self.config.blacklist_duration;
        self.blacklist.retain(|_, at| now.saturating_duration_since(*at) < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 6881))
    }

    /// Deliver queued packets between two nodes until both are quiet
    fn ferry(a: &mut DHT, a_addr: SocketAddr, b: &mut DHT, b_addr: SocketAddr, now: Instant) {
        for _ in 0..20 {
            let from_a = a.drain_outbox();
            let from_b = b.drain_outbox();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for (to, data) in from_a {
                if to == b_addr {
                    b.handle_packet(&data, a_addr, now);
                }
            }
            for (to, data) in from_b {
                if to == a_addr {
                    a.handle_packet(&data, b_addr, now);
                }
            }
        }
    }

    fn reply(dht: &mut DHT) -> DHTMessage {
        let mut out = dht.drain_outbox();
        let (_, data) = out.pop().unwrap();
        DHTMessage::deserialize(&data).unwrap()
    }

    fn query(dht: &mut DHT, from: SocketAddr, querier: NodeId, q: Query, now: Instant) -> DHTMessage {
        let data = DHTMessage::query(b"qq".to_vec(), querier, q).serialize().unwrap();
        dht.handle_packet(&data, from, now);
        reply(dht)
    }

    #[test]
    fn test_announce_requires_current_or_previous_token() {
        let now = Instant::now();
        let mut dht = DHT::new(NodeId::random(), DhtConfig::default(), now);
        let querier = NodeId::random();
        let info_hash = [9u8; 20];

        let response = query(&mut dht, addr(1), querier, Query::GetPeers { info_hash }, now);
        let Body::Response(r) = response.body else {
            panic!("expected a reply");
        };
        let token = r.token.unwrap();

        let announce = |token: Vec<u8>| Query::AnnouncePeer {
            info_hash,
            port: 7000,
            token,
            implied_port: false,
        };

        let bad = query(&mut dht, addr(1), querier, announce(b"forged".to_vec()), now);
        assert!(matches!(bad.body, Body::Error { code: ERROR_PROTOCOL, .. }));
        assert!(dht.stored_peers(&info_hash, now).is_empty());

        // One rotation later the token is previous and still accepted
        let later = now + Duration::from_secs(5 * 60);
        dht.tick(later);
        let ok = query(&mut dht, addr(1), querier, announce(token.clone()), later);
        assert!(matches!(ok.body, Body::Response(_)));
        assert_eq!(dht.stored_peers(&info_hash, later), vec![SocketAddr::from(([10, 0, 0, 1], 7000))]);

        // Two rotations later it is gone
        let much_later = later + Duration::from_secs(5 * 60);
        dht.tick(much_later);
        let stale = query(&mut dht, addr(1), querier, announce(token), much_later);
        assert!(matches!(stale.body, Body::Error { code: ERROR_PROTOCOL, .. }));
    }

    #[test]
    fn test_token_is_per_node() {
        let now = Instant::now();
        let mut dht = DHT::new(NodeId::random(), DhtConfig::default(), now);
        let info_hash = [1u8; 20];
        let alice = NodeId::random();
        let Body::Response(r) = query(&mut dht, addr(1), alice, Query::GetPeers { info_hash }, now).body else {
            panic!("expected a reply");
        };
        let token = r.token.unwrap();

        let mallory = NodeId::random();
        let stolen = query(
            &mut dht,
            addr(2),
            mallory,
            Query::AnnouncePeer {
                info_hash,
                port: 1,
                token,
                implied_port: false,
            },
            now,
        );
        assert!(matches!(stolen.body, Body::Error { code: ERROR_PROTOCOL, .. }));
    }

    #[test]
    fn test_unknown_method_gets_204() {
        let now = Instant::now();
        let mut dht = DHT::new(NodeId::random(), DhtConfig::default(), now);
        let response = query(&mut dht, addr(1), NodeId::random(), Query::Unknown("vote".to_string()), now);
        assert!(matches!(response.body, Body::Error { code: ERROR_METHOD_UNKNOWN, .. }));
    }

    #[test]
    fn test_bootstrap_and_get_peers_between_two_nodes() {
        let now = Instant::now();
        let (a_addr, b_addr) = (addr(1), addr(2));
        let mut a = DHT::new(NodeId::random(), DhtConfig::default(), now);
        let mut b = DHT::new(NodeId::random(), DhtConfig::default(), now);

        a.bootstrap(&[b_addr], now);
        ferry(&mut a, a_addr, &mut b, b_addr, now);
        assert!(a.table().in_table(&b.id()));
        assert!(b.table().in_table(&a.id()));

        let info_hash = [7u8; 20];
        let stored = SocketAddr::from(([192, 0, 2, 1], 51413));
        b.peers.add(info_hash, stored, now, 100);

        a.get_peers(info_hash, Some(6000), now);
        ferry(&mut a, a_addr, &mut b, b_addr, now);

        let events = a.drain_events();
        assert!(events.contains(&DhtEvent::Peers {
            info_hash,
            peers: vec![stored]
        }));

        // Finishing the search announces us to the node that gave a token
        a.tick(now);
        ferry(&mut a, a_addr, &mut b, b_addr, now);
        assert!(a
            .drain_events()
            .iter()
            .any(|e| matches!(e, DhtEvent::SearchDone { peers: 1, .. })));
        assert!(b
            .stored_peers(&info_hash, now)
            .contains(&SocketAddr::from(([10, 0, 0, 1], 6000))));
    }

    #[test]
    fn test_cancelled_search_never_announces() {
        let now = Instant::now();
        let (a_addr, b_addr) = (addr(1), addr(2));
        let mut a = DHT::new(NodeId::random(), DhtConfig::default(), now);
        let mut b = DHT::new(NodeId::random(), DhtConfig::default(), now);
        a.bootstrap(&[b_addr], now);
        ferry(&mut a, a_addr, &mut b, b_addr, now);

        let info_hash = [8u8; 20];
        a.get_peers(info_hash, Some(6000), now);
        ferry(&mut a, a_addr, &mut b, b_addr, now);
        assert!(a.cancel_search(info_hash));
        assert!(!a.cancel_search(info_hash));
        assert_eq!(a.active_searches(), 0);

        let later = now + Duration::from_secs(60);
        a.tick(later);
        let outgoing = a.drain_outbox();
        assert!(!outgoing.iter().any(|(_, data)| matches!(
            DHTMessage::deserialize(data).map(|m| m.body),
            Ok(Body::Query { query: Query::AnnouncePeer { .. }, .. })
        )));
        for (to, data) in outgoing {
            if to == b_addr {
                b.handle_packet(&data, a_addr, later);
            }
        }
        assert!(b.stored_peers(&info_hash, later).is_empty());
        assert!(!a
            .drain_events()
            .iter()
            .any(|e| matches!(e, DhtEvent::SearchDone { target, .. } if *target == NodeId(info_hash))));
    }

    #[test]
    fn test_unanswered_queries_expire_as_lost_pings() {
        let now = Instant::now();
        let mut dht = DHT::new(NodeId::random(), DhtConfig::default(), now);
        let node = NodeId::random();
        dht.table.observe(node, addr(3), now);
        dht.ping_node(node, now);
        assert_eq!(dht.pending_queries(), 1);

        dht.tick(now + Duration::from_secs(179));
        assert_eq!(dht.pending_queries(), 1);
        dht.tick(now + Duration::from_secs(180));
        assert_eq!(dht.pending_queries(), 0);
        assert_eq!(dht.table().node(&node).unwrap().failed_pings, 1);
    }

    #[test]
    fn test_repeated_id_changes_blacklist_address() {
        let now = Instant::now();
        let mut dht = DHT::new(NodeId::random(), DhtConfig::default(), now);
        for _ in 0..3 {
            let data = DHTMessage::query(b"pp".to_vec(), NodeId::random(), Query::Ping)
                .serialize()
                .unwrap();
            dht.handle_packet(&data, addr(8), now);
        }
        assert!(dht.is_blacklisted(&addr(8).ip()));
        assert!(dht.table().id_at(&addr(8)).is_none());
    }

    #[test]
    fn test_reply_from_wrong_address_ignored() {
        let now = Instant::now();
        let mut dht = DHT::new(NodeId::random(), DhtConfig::default(), now);
        dht.ping(addr(4), now);
        let (_, data) = dht.drain_outbox().pop().unwrap();
        let sent = DHTMessage::deserialize(&data).unwrap();

        let fake = DHTMessage::response(sent.transaction.clone(), Response::new(NodeId::random()), addr(9));
        dht.handle_packet(&fake.serialize().unwrap(), addr(5), now);
        assert_eq!(dht.pending_queries(), 1);
        assert_eq!(dht.node_count(), 0);
    }

    #[test]
    fn test_spoofed_ip_report_blacklists_sender() {
        let now = Instant::now();
        let mut dht = DHT::new(NodeId::random(), DhtConfig::default(), now);
        dht.ping(addr(6), now);
        let (_, data) = dht.drain_outbox().pop().unwrap();
        let sent = DHTMessage::deserialize(&data).unwrap();

        // Claims we are at its own address
        let liar = DHTMessage::response(sent.transaction, Response::new(NodeId::random()), addr(6));
        dht.handle_packet(&liar.serialize().unwrap(), addr(6), now);
        assert!(dht.is_blacklisted(&addr(6).ip()));
        assert_eq!(dht.node_count(), 0);
    }

    #[test]
    fn test_state_roundtrip_restores_nodes() {
        let now = Instant::now();
        let (a_addr, b_addr) = (addr(1), addr(2));
        let mut a = DHT::new(NodeId::random(), DhtConfig::default(), now);
        let mut b = DHT::new(NodeId::random(), DhtConfig::default(), now);
        a.bootstrap(&[b_addr], now);
        ferry(&mut a, a_addr, &mut b, b_addr, now);

        let state = a.state();
        let restored = DHT::from_state(&state, DhtConfig::default(), now).unwrap();
        assert_eq!(restored.id(), a.id());
        assert!(restored.table().in_table(&b.id()));
        assert_eq!(restored.pending_queries(), 1);
    }
}
