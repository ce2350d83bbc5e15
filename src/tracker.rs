//! Tracker collaborator
//!
//! The swarm reports lifecycle events and byte counters through [`Tracker`]
//! and receives peer addresses back. Concrete HTTP/UDP clients live outside
//! this crate; [`NullTracker`] and [`StaticTracker`] cover the trackerless
//! and manually seeded cases.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::peer::{PeerInfo, PeerSource};

/// Lifecycle event reported with an announce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
    /// Regular re-announce
    Periodic,
}

impl fmt::Display for TrackerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
            TrackerEvent::Periodic => "periodic",
        };
        f.write_str(name)
    }
}

/// Byte counters sent with every announce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Source of peer addresses driven by swarm lifecycle events
#[async_trait]
pub trait Tracker: Send {
    async fn announce(&mut self, event: TrackerEvent, stats: AnnounceStats) -> Result<Vec<PeerInfo>>;
}

/// Tracker that never returns peers
#[derive(Debug, Default)]
pub struct NullTracker;

#[async_trait]
impl Tracker for NullTracker {
    async fn announce(&mut self, event: TrackerEvent, stats: AnnounceStats) -> Result<Vec<PeerInfo>> {
        debug!("Announce {} skipped (no tracker), left {}", event, stats.left);
        Ok(Vec::new())
    }
}

/// Fixed list of peers, handed out on the first announce
#[derive(Debug, Default)]
pub struct StaticTracker {
    peers: Vec<PeerInfo>,
}

impl StaticTracker {
    pub fn new(addrs: impl IntoIterator<Item = std::net::SocketAddr>) -> Self {
        Self {
            peers: addrs.into_iter().map(|a| PeerInfo::new(a, PeerSource::Manual)).collect(),
        }
    }
}

#[async_trait]
impl Tracker for StaticTracker {
    async fn announce(&mut self, event: TrackerEvent, _stats: AnnounceStats) -> Result<Vec<PeerInfo>> {
        if event == TrackerEvent::Started {
            debug!("Handing out {} manual peers", self.peers.len());
            return Ok(self.peers.clone());
        }
        Ok(Vec::new())
    }
}
