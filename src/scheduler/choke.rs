//! Choking and interest policy
//!
//! Every choke interval the fastest interested peers are unchoked (download
//! rate while leeching, upload rate while seeding). On the slower optimistic
//! interval one more choked, interested peer is picked at random, weighted
//! towards recently connected peers. Nothing else ever unchokes, so at most
//! `max_uploaders + 1` sessions are unchoked at any time.

use std::time::{Duration, Instant};

use rand::distributions::{Distribution, WeightedIndex};
use tracing::{debug, trace};

use crate::peer::{PeerSession, SessionId};
use crate::storage::piece::PieceStore;

/// Peers connected more recently than this get a higher optimistic weight
pub const RECENT_PEER_WINDOW: Duration = Duration::from_secs(60);

/// Weight multiplier for recently connected peers
const RECENT_WEIGHT: u32 = 3;

/// Choking parameters
#[derive(Debug, Clone)]
pub struct ChokeConfig {
    pub max_uploaders: usize,
    pub min_uploaders: usize,
    pub max_downloading_peers: usize,
    pub choke_interval: Duration,
    pub optimistic_interval: Duration,
}

impl Default for ChokeConfig {
    fn default() -> Self {
        Self {
            max_uploaders: 4,
            min_uploaders: 1,
            max_downloading_peers: 20,
            choke_interval: Duration::from_secs(10),
            optimistic_interval: Duration::from_secs(30),
        }
    }
}

/// Periodic choke/unchoke decisions for one swarm
#[derive(Debug)]
pub struct ChokeScheduler {
    config: ChokeConfig,
    last_choke: Option<Instant>,
    last_optimistic: Option<Instant>,
    optimistic: Option<SessionId>,
}

impl ChokeScheduler {
    pub fn new(config: ChokeConfig) -> Self {
        Self {
            config,
            last_choke: None,
            last_optimistic: None,
            optimistic: None,
        }
    }

    pub fn config(&self) -> &ChokeConfig {
        &self.config
    }

    /// Current optimistic unchoke, if any
    pub fn optimistic(&self) -> Option<SessionId> {
        self.optimistic
    }

    /// Forget a departed session
    pub fn remove(&mut self, id: SessionId) {
        if self.optimistic == Some(id) {
            self.optimistic = None;
        }
    }

    /// Run a choke round if one is due. Returns whether it ran.
    pub fn tick(&mut self, now: Instant, seeding: bool, sessions: &mut [&mut PeerSession]) -> bool {
        let due = self
            .last_choke
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.choke_interval);
        if !due {
            return false;
        }
        self.last_choke = Some(now);

        // Rank interested peers by throughput
        let mut ranked: Vec<(usize, f64)> = sessions
            .iter_mut()
            .enumerate()
            .filter(|(_, s)| s.state.is_established() && !s.duplicate && s.peer_interested)
            .map(|(i, s)| (i, s.ranking_rate(seeding, now)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut unchoke: Vec<usize> = ranked.iter().take(self.config.max_uploaders).map(|(i, _)| *i).collect();

        // Keep a floor of open slots even when few peers are interested
        if unchoke.len() < self.config.min_uploaders {
            let mut idle: Vec<(usize, f64)> = sessions
                .iter_mut()
                .enumerate()
                .filter(|(i, s)| s.state.is_established() && !s.duplicate && !unchoke.contains(i))
                .map(|(i, s)| (i, s.ranking_rate(seeding, now)))
                .collect();
            idle.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            let room = self.config.min_uploaders - unchoke.len();
            unchoke.extend(idle.into_iter().take(room).map(|(i, _)| i));
        }

        let optimistic_due = self
            .last_optimistic
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.optimistic_interval);
        let current = self
            .optimistic
            .and_then(|id| sessions.iter().position(|s| s.id == id))
            .filter(|i| !unchoke.contains(i) && sessions[*i].peer_interested);

        let optimistic = if optimistic_due || current.is_none() {
            self.last_optimistic = Some(now);
            self.pick_optimistic(now, sessions, &unchoke)
        } else {
            current
        };
        self.optimistic = optimistic.map(|i| sessions[i].id);
        if let Some(i) = optimistic {
            unchoke.push(i);
        }

        for (i, session) in sessions.iter_mut().enumerate() {
            if !session.state.is_established() {
                continue;
            }
            session.set_choking(!unchoke.contains(&i), now);
        }

        debug!(
            "Choke round: {} unchoked of {} ({} optimistic)",
            unchoke.len(),
            sessions.len(),
            self.optimistic.map_or_else(|| "none".to_string(), |id| id.to_string())
        );
        true
    }

    fn pick_optimistic(&self, now: Instant, sessions: &[&mut PeerSession], regular: &[usize]) -> Option<usize> {
        let candidates: Vec<usize> = (0..sessions.len())
            .filter(|i| {
                let s = &sessions[*i];
                s.state.is_established() && !s.duplicate && s.peer_interested && !regular.contains(i)
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let weights: Vec<u32> = candidates
            .iter()
            .map(|&i| {
                if now.saturating_duration_since(sessions[i].connected_at) < RECENT_PEER_WINDOW {
                    RECENT_WEIGHT
                } else {
                    1
                }
            })
            .collect();
        let dist = WeightedIndex::new(&weights).ok()?;
        let choice = candidates[dist.sample(&mut rand::thread_rng())];
        trace!("Optimistic unchoke candidate {}", sessions[choice].id);
        Some(choice)
    }

    /// Recompute our interest in one peer.
    ///
    /// Interested only while the peer has a piece we still need; new interest
    /// is withheld once `max_downloading_peers` sessions already have it.
    pub fn update_interest(&self, session: &mut PeerSession, store: &PieceStore, interested_count: usize, now: Instant) {
        let needed = session.pieces.iter_set().any(|p| !store.have().get(p));
        if needed && !session.am_interested && interested_count >= self.config.max_downloading_peers {
            return;
        }
        session.set_interested(needed, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerSource, SessionState};
    use crate::torrent::TorrentInfo;

    fn session(id: u64, now: Instant) -> PeerSession {
        let mut s = PeerSession::new(SessionId(id), format!("10.0.0.{}:6881", id).parse().unwrap(), PeerSource::Manual, 4, now);
        s.set_state(SessionState::Established);
        s.peer_interested = true;
        s
    }

    fn unchoked(sessions: &[PeerSession]) -> usize {
        sessions.iter().filter(|s| !s.am_choking).count()
    }

    #[test]
    fn test_fastest_peers_unchoked() {
        let now = Instant::now();
        let mut sessions: Vec<PeerSession> = (0..6).map(|i| session(i, now)).collect();
        for (i, s) in sessions.iter_mut().enumerate() {
            s.download.record(1000 * (i as u64 + 1), now);
        }

        let mut choker = ChokeScheduler::new(ChokeConfig::default());
        let mut refs: Vec<&mut PeerSession> = sessions.iter_mut().collect();
        assert!(choker.tick(now, false, &mut refs));

        // Top four by rate are ids 5,4,3,2
        for id in 2..6 {
            assert!(!sessions[id].am_choking);
        }
        assert_eq!(unchoked(&sessions), 5);
        let optimistic = choker.optimistic().unwrap();
        assert!(optimistic == SessionId(0) || optimistic == SessionId(1));
    }

    #[test]
    fn test_unchoked_never_exceeds_max_plus_one() {
        let start = Instant::now();
        let mut sessions: Vec<PeerSession> = (0..12).map(|i| session(i, start)).collect();
        let mut choker = ChokeScheduler::new(ChokeConfig::default());

        for round in 0..20u64 {
            let now = start + Duration::from_secs(round * 10);
            for (i, s) in sessions.iter_mut().enumerate() {
                s.download.record(((i as u64 * 7 + round * 3) % 11) * 1000, now);
                s.peer_interested = (i as u64 + round) % 3 != 0;
            }
            let mut refs: Vec<&mut PeerSession> = sessions.iter_mut().collect();
            choker.tick(now, round % 2 == 0, &mut refs);
            assert!(unchoked(&sessions) <= 4 + 1, "round {}", round);
        }
    }

    #[test]
    fn test_not_due_between_intervals() {
        let now = Instant::now();
        let mut sessions = vec![session(1, now)];
        let mut choker = ChokeScheduler::new(ChokeConfig::default());
        let mut refs: Vec<&mut PeerSession> = sessions.iter_mut().collect();
        assert!(choker.tick(now, false, &mut refs));
        assert!(!choker.tick(now + Duration::from_secs(5), false, &mut refs));
        assert!(choker.tick(now + Duration::from_secs(10), false, &mut refs));
    }

    #[test]
    fn test_min_uploaders_floor() {
        let now = Instant::now();
        let mut sessions = vec![session(1, now), session(2, now)];
        sessions.iter_mut().for_each(|s| s.peer_interested = false);
        let mut choker = ChokeScheduler::new(ChokeConfig::default());
        let mut refs: Vec<&mut PeerSession> = sessions.iter_mut().collect();
        choker.tick(now, false, &mut refs);
        assert_eq!(unchoked(&sessions), 1);
    }

    #[test]
    fn test_interest_follows_needed_pieces() {
        let now = Instant::now();
        let content = vec![0u8; 4 * 16384];
        let store = PieceStore::new(&TorrentInfo::for_content("c", 16384, &content));
        let choker = ChokeScheduler::new(ChokeConfig::default());
        let mut s = session(1, now);

        choker.update_interest(&mut s, &store, 0, now);
        assert!(!s.am_interested);

        s.pieces.set(2, true);
        choker.update_interest(&mut s, &store, 0, now);
        assert!(s.am_interested);

        let mut t = session(2, now);
        t.pieces.set(1, true);
        choker.update_interest(&mut t, &store, 20, now);
        assert!(!t.am_interested);
    }
}
