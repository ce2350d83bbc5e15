//! External address voting
//!
//! Replies may tell us which address the sender saw us at. A changed
//! address is only believed after enough distinct sources agree; the node id
//! is then derived from it.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use rand::Rng;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::dht::node::NodeId;

/// Distinct sources needed to accept a new external address
pub const REQUIRED_VOTES: usize = 3;

/// Result of one report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Matches what we already believe
    Agrees,
    Pending,
    Confirmed(IpAddr),
    /// Sender claims we share its own address; it should be blacklisted
    Spoof,
}

/// Tally of external address reports
#[derive(Debug, Default)]
pub struct IpVoter {
    current: Option<IpAddr>,
    votes: HashMap<IpAddr, HashSet<IpAddr>>,
}

impl IpVoter {
    pub fn new(current: Option<IpAddr>) -> Self {
        Self {
            current,
            votes: HashMap::new(),
        }
    }

    pub fn current(&self) -> Option<IpAddr> {
        self.current
    }

    /// Record that `from` saw us at `reported`
    pub fn report(&mut self, reported: IpAddr, from: SocketAddr) -> VoteOutcome {
        if self.current == Some(reported) {
            return VoteOutcome::Agrees;
        }

        let voters = self.votes.entry(reported).or_default();
        if voters.is_empty() && reported == from.ip() {
            self.votes.remove(&reported);
            warn!("{} reported its own address as ours", from);
            return VoteOutcome::Spoof;
        }

        voters.insert(from.ip());
        debug!("External address vote {} from {} ({}/{})", reported, from, voters.len(), REQUIRED_VOTES);
        if voters.len() < REQUIRED_VOTES {
            return VoteOutcome::Pending;
        }

        info!("External address confirmed: {}", reported);
        self.current = Some(reported);
        self.votes.clear();
        VoteOutcome::Confirmed(reported)
    }
}

/// Node id derived from an external address and a random byte
pub fn id_for_ip(ip: IpAddr) -> NodeId {
    let r: u8 = rand::thread_rng().gen();
    id_for_ip_with(ip, r)
}

/// `sha1(masked ip || r)` with `r` stored in the last byte
pub fn id_for_ip_with(ip: IpAddr, r: u8) -> NodeId {
    let mut masked = match ip {
        IpAddr::V4(v4) => {
            let mask = [0x03, 0x0f, 0x3f, 0xff];
            v4.octets().iter().zip(mask).map(|(b, m)| b & m).collect::<Vec<u8>>()
        }
        IpAddr::V6(v6) => {
            let mask = [0x01, 0x03, 0x07, 0x0f, 0x1f, 0x3f, 0x7f, 0xff];
            v6.octets()[..8].iter().zip(mask).map(|(b, m)| b & m).collect::<Vec<u8>>()
        }
    };
    masked.push(r);

    let mut hasher = Sha1::new();
    hasher.update(&masked);
    let mut id = NodeId([0u8; 20]);
    id.0.copy_from_slice(&hasher.finalize());
    id.0[19] = r;
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 6881)
    }

    #[test]
    fn test_three_distinct_sources_confirm() {
        let ours: IpAddr = "203.0.113.7".parse().unwrap();
        let mut voter = IpVoter::new(None);
        assert_eq!(voter.report(ours, from("10.0.0.1")), VoteOutcome::Pending);
        // Same source twice counts once
        assert_eq!(voter.report(ours, from("10.0.0.1")), VoteOutcome::Pending);
        assert_eq!(voter.report(ours, from("10.0.0.2")), VoteOutcome::Pending);
        assert_eq!(voter.report(ours, from("10.0.0.3")), VoteOutcome::Confirmed(ours));
        assert_eq!(voter.current(), Some(ours));
        assert_eq!(voter.report(ours, from("10.0.0.4")), VoteOutcome::Agrees);
    }

    #[test]
    fn test_self_report_is_spoof() {
        let mut voter = IpVoter::new(Some("203.0.113.7".parse().unwrap()));
        let liar = from("198.51.100.9");
        assert_eq!(voter.report(liar.ip(), liar), VoteOutcome::Spoof);
        assert_eq!(voter.current(), Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn test_self_report_counts_once_others_agree() {
        let claimed: IpAddr = "198.51.100.9".parse().unwrap();
        let mut voter = IpVoter::new(None);
        assert_eq!(voter.report(claimed, from("10.0.0.1")), VoteOutcome::Pending);
        assert_eq!(voter.report(claimed, from("198.51.100.9")), VoteOutcome::Pending);
    }

    #[test]
    fn test_id_derivation_is_deterministic() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        let a = id_for_ip_with(ip, 5);
        assert_eq!(a, id_for_ip_with(ip, 5));
        assert_ne!(a, id_for_ip_with(ip, 6));
        assert_eq!(a.0[19], 5);
        // Masked-out bits do not change the id
        assert_eq!(a, id_for_ip_with("207.0.113.7".parse().unwrap(), 5));
    }
}
