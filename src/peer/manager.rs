//! Peer manager module
//!
//! Owns a swarm's sessions, their outgoing channels and the pool of known
//! peer addresses. Lives inside the swarm's controller task; no locking.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::peer::connection::PeerSender;
use crate::peer::{PeerInfo, PeerSession, PeerSource, SessionId, SessionState};

/// First reconnect delay; doubles per consecutive failure
const RETRY_BASE: Duration = Duration::from_secs(30);

/// Longest reconnect delay
const RETRY_MAX: Duration = Duration::from_secs(30 * 60);

/// Addresses are forgotten after this many consecutive failures
const MAX_FAILURES: u32 = 6;

/// A peer address we may connect to
#[derive(Debug, Clone)]
pub struct KnownPeer {
    pub info: PeerInfo,
    pub failures: u32,
    pub last_attempt: Option<Instant>,
}

impl KnownPeer {
    fn retry_at(&self) -> Option<Instant> {
        let at = self.last_attempt?;
        let backoff = RETRY_BASE.saturating_mul(1 << self.failures.min(10)).min(RETRY_MAX);
        Some(at + if self.failures == 0 { Duration::ZERO } else { backoff })
    }
}

/// Manages all peer sessions for a torrent
#[derive(Debug)]
pub struct PeerManager {
    sessions: HashMap<SessionId, PeerSession>,
    senders: HashMap<SessionId, PeerSender>,
    known: HashMap<SocketAddr, KnownPeer>,
    max_connections: usize,
}

impl PeerManager {
    /// Create a new peer manager
    pub fn new(max_connections: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            senders: HashMap::new(),
            known: HashMap::new(),
            max_connections,
        }
    }

    /// Add discovered addresses to the pool, returning how many were new
    pub fn add_peers(&mut self, peers: impl IntoIterator<Item = PeerInfo>) -> usize {
        let mut added = 0;
        for info in peers {
            if !self.known.contains_key(&info.addr) {
                trace!("Known peer {} from {:?}", info.addr, info.source);
                self.known.insert(info.addr, KnownPeer { info, failures: 0, last_attempt: None });
                added += 1;
            }
        }
        if added > 0 {
            debug!("Added {} peers (known: {})", added, self.known.len());
        }
        added
    }

    /// Number of known addresses
    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// Free connection slots
    pub fn slots(&self) -> usize {
        self.max_connections.saturating_sub(self.sessions.len())
    }

    /// Addresses to dial now, marking them attempted
    pub fn next_candidates(&mut self, now: Instant, limit: usize) -> Vec<PeerInfo> {
        let connected: Vec<SocketAddr> = self.sessions.values().map(|s| s.addr).collect();
        let mut ready: Vec<&mut KnownPeer> = self
            .known
            .values_mut()
            .filter(|k| !connected.contains(&k.info.addr))
            .filter(|k| k.retry_at().map_or(true, |at| now >= at))
            .collect();
        ready.sort_by_key(|k| (k.failures, k.last_attempt));

        ready
            .into_iter()
            .take(limit.min(self.max_connections.saturating_sub(self.sessions.len())))
            .map(|k| {
                k.last_attempt = Some(now);
                k.info.clone()
            })
            .collect()
    }

    /// Note a failed or dropped connection to `addr`
    pub fn record_failure(&mut self, addr: SocketAddr) {
        if let Some(known) = self.known.get_mut(&addr) {
            known.failures += 1;
            if known.failures >= MAX_FAILURES {
                debug!("Forgetting {} after {} failures", addr, known.failures);
                self.known.remove(&addr);
            }
        }
    }

    /// Note a successful handshake with `addr`
    pub fn record_success(&mut self, addr: SocketAddr, peer_id: [u8; 20]) {
        if let Some(known) = self.known.get_mut(&addr) {
            known.failures = 0;
            known.info.peer_id = Some(peer_id);
        }
    }

    /// Drop an address from the pool
    pub fn forget(&mut self, addr: &SocketAddr) {
        self.known.remove(addr);
    }

    /// Register a session and its outgoing channel
    pub fn insert(&mut self, session: PeerSession, sender: PeerSender) {
        let id = session.id;
        if session.source == PeerSource::Incoming {
            self.known.entry(session.addr).or_insert_with(|| KnownPeer {
                info: PeerInfo::new(session.addr, PeerSource::Incoming),
                failures: 0,
                last_attempt: None,
            });
        }
        self.sessions.insert(id, session);
        self.senders.insert(id, sender);
    }

    /// Unregister a session; dropping its sender closes the connection task
    /// once the messages still queued for it are written
    pub fn remove(&mut self, id: SessionId) -> Option<PeerSession> {
        let sender = self.senders.remove(&id);
        let mut session = self.sessions.remove(&id)?;
        if let Some(sender) = sender {
            for message in session.drain_outbox() {
                if sender.send(message).is_err() {
                    break;
                }
            }
        }
        session.set_state(SessionState::Closed);
        info!("Removed {} {} (remaining: {})", id, session.addr, self.sessions.len());
        Some(session)
    }

    pub fn get(&self, id: SessionId) -> Option<&PeerSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut PeerSession> {
        self.sessions.values_mut()
    }

    /// Whether a session to `addr` exists
    pub fn is_connected(&self, addr: &SocketAddr) -> bool {
        self.sessions.values().any(|s| &s.addr == addr)
    }

    /// Another established session using `peer_id`, if any
    pub fn find_by_peer_id(&self, peer_id: &[u8; 20], except: SessionId) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.id != except && !s.duplicate && s.peer_id.as_ref() == Some(peer_id))
            .map(|s| s.id)
    }

    /// Hand every queued message to the connection tasks
    pub fn flush(&mut self) {
        for (id, session) in self.sessions.iter_mut() {
            if session.outbox.is_empty() {
                continue;
            }
            let Some(sender) = self.senders.get(id) else {
                continue;
            };
            for message in session.drain_outbox() {
                if sender.send(message).is_err() {
                    warn!("{} writer is gone", id);
                    break;
                }
            }
        }
    }
}
