//! DHT service
//!
//! Owns the UDP socket and the [`DHT`] state in a single task. Swarms talk
//! to it through a cloneable [`DhtHandle`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

use crate::dht::bootstrap::BootstrapConfig;
use crate::dht::dht::{DhtConfig, DhtEvent, DHT};
use crate::dht::node::NodeId;
use crate::dht::persist::DhtState;
use crate::error::TorrentError;

/// Largest datagram we read
const MAX_PACKET: usize = 2048;

/// Minimum gap between bootstrap attempts while the table is empty
const BOOTSTRAP_RETRY: Duration = Duration::from_secs(60);

/// Settings for the DHT task
#[derive(Debug, Clone)]
pub struct DhtServiceConfig {
    pub bind: SocketAddr,
    pub state_file: Option<PathBuf>,
    pub bootstrap: BootstrapConfig,
    pub save_interval: Duration,
    pub tick_interval: Duration,
    pub dht: DhtConfig,
}

impl DhtServiceConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            state_file: None,
            bootstrap: BootstrapConfig::default(),
            save_interval: Duration::from_secs(15 * 60),
            tick_interval: Duration::from_secs(1),
            dht: DhtConfig::default(),
        }
    }
}

/// Requests accepted by the DHT task
#[derive(Debug)]
pub enum DhtCommand {
    /// Search for peers; results stream to `reply` until it is dropped
    GetPeers {
        info_hash: [u8; 20],
        announce_port: Option<u16>,
        reply: mpsc::UnboundedSender<Vec<SocketAddr>>,
    },
    /// Stop searching for `info_hash` and drop its subscribers
    Cancel([u8; 20]),
    /// Ping a node we heard about elsewhere
    AddNode(SocketAddr),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running DHT task
#[derive(Debug, Clone)]
pub struct DhtHandle {
    commands: mpsc::UnboundedSender<DhtCommand>,
    local_addr: SocketAddr,
    id: NodeId,
}

impl DhtHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Id at startup; it may later change after external address voting
    pub fn initial_id(&self) -> NodeId {
        self.id
    }

    /// Start a peer search for `info_hash`
    pub fn get_peers(
        &self,
        info_hash: [u8; 20],
        announce_port: Option<u16>,
        reply: mpsc::UnboundedSender<Vec<SocketAddr>>,
    ) -> Result<()> {
        self.commands
            .send(DhtCommand::GetPeers {
                info_hash,
                announce_port,
                reply,
            })
            .map_err(|_| TorrentError::dht_error("DHT task is not running").into())
    }

    /// Abandon the search for `info_hash`; no announce follows
    pub fn cancel(&self, info_hash: [u8; 20]) -> Result<()> {
        self.commands
            .send(DhtCommand::Cancel(info_hash))
            .map_err(|_| TorrentError::dht_error("DHT task is not running").into())
    }

    pub fn add_node(&self, addr: SocketAddr) -> Result<()> {
        self.commands
            .send(DhtCommand::AddNode(addr))
            .map_err(|_| TorrentError::dht_error("DHT task is not running").into())
    }

    /// Stop the task, waiting for it to save state
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(DhtCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Bind the socket, restore saved state and spawn the DHT task
pub async fn start(config: DhtServiceConfig) -> Result<DhtHandle> {
    let socket = UdpSocket::bind(config.bind).await.map_err(|e| {
        error!("Failed to bind UDP socket to {}: {}", config.bind, e);
        TorrentError::network_error_full("Failed to bind DHT socket", config.bind.to_string(), e.to_string())
    })?;
    let local_addr = socket.local_addr()?;
    let now = Instant::now();

    let restored = match &config.state_file {
        Some(path) => match DhtState::load(path).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Ignoring unreadable DHT state {}: {}", path.display(), e);
                None
            }
        },
        None => None,
    };
    let dht = match restored {
        Some(state) => DHT::from_state(&state, config.dht.clone(), now)?,
        None => DHT::new(NodeId::random(), config.dht.clone(), now),
    };
    let id = dht.id();
    info!("DHT listening on: {}", local_addr);

    let (commands, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(socket, dht, config, rx));
    Ok(DhtHandle {
        commands,
        local_addr,
        id,
    })
}

struct Service {
    socket: UdpSocket,
    dht: DHT,
    config: DhtServiceConfig,
    subscribers: Subscribers,
    last_bootstrap: Option<Instant>,
}

async fn run(socket: UdpSocket, dht: DHT, config: DhtServiceConfig, mut commands: mpsc::UnboundedReceiver<DhtCommand>) {
    let mut ticker = interval(config.tick_interval);
    let mut saver = interval(config.save_interval);
    saver.tick().await;
    let mut service = Service {
        socket,
        dht,
        config,
        subscribers: Subscribers::default(),
        last_bootstrap: None,
    };
    let mut buf = vec![0u8; MAX_PACKET];

    let done = loop {
        tokio::select! {
            received = service.socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => service.dht.handle_packet(&buf[..len], from, Instant::now()),
                Err(e) => debug!("DHT receive error: {}", e),
            },
            command = commands.recv() => match command {
                Some(DhtCommand::GetPeers { info_hash, announce_port, reply }) => {
                    service.subscribers.add(info_hash, reply);
                    service.dht.get_peers(info_hash, announce_port, Instant::now());
                }
                Some(DhtCommand::Cancel(info_hash)) => {
                    debug!(
                        "Cancelling DHT search for {} ({} subscribers)",
                        hex::encode(info_hash),
                        service.subscribers.count(&info_hash)
                    );
                    service.subscribers.remove(&info_hash);
                    service.dht.cancel_search(info_hash);
                }
                Some(DhtCommand::AddNode(addr)) => service.dht.ping(addr, Instant::now()),
                Some(DhtCommand::Shutdown(done)) => break Some(done),
                None => break None,
            },
            _ = ticker.tick() => {
                let now = Instant::now();
                service.dht.tick(now);
                service.maybe_bootstrap(now).await;
            },
            _ = saver.tick() => service.save().await,
        }
        service.flush().await;
        service.dispatch();
    };

    service.save().await;
    info!("DHT stopped ({} nodes)", service.dht.node_count());
    if let Some(done) = done {
        let _ = done.send(());
    }
}

impl Service {
    async fn maybe_bootstrap(&mut self, now: Instant) {
        if !self.dht.table().is_empty() || self.dht.pending_queries() > 0 {
            return;
        }
        if self
            .last_bootstrap
            .map_or(false, |at| now.saturating_duration_since(at) < BOOTSTRAP_RETRY)
        {
            return;
        }
        self.last_bootstrap = Some(now);
        let addrs = self.config.bootstrap.resolve().await;
        if addrs.is_empty() {
            warn!("No DHT bootstrap nodes could be resolved");
            return;
        }
        self.dht.bootstrap(&addrs, Instant::now());
    }

    async fn flush(&mut self) {
        for (addr, data) in self.dht.drain_outbox() {
            if let Err(e) = self.socket.send_to(&data, addr).await {
                trace!("{}", TorrentError::dht_error_with_node("send failed", addr.to_string()).with_context(e.to_string()));
            }
        }
    }

    fn dispatch(&mut self) {
        for event in self.dht.drain_events() {
            match event {
                DhtEvent::Peers { info_hash, peers } => self.subscribers.publish(&info_hash, &peers),
                DhtEvent::SearchDone { target, peers } => debug!("DHT search for {} found {} peers", target, peers),
                DhtEvent::IdChanged(id) => info!("DHT node id is now {}", id),
            }
        }
    }

    async fn save(&self) {
        let Some(path) = &self.config.state_file else {
            return;
        };
        if let Err(e) = self.dht.state().save(path).await {
            warn!("Failed to save DHT state to {}: {}", path.display(), e);
        }
    }
}

/// Peer channels waiting on each info hash
#[derive(Debug, Default)]
struct Subscribers {
    by_hash: HashMap<[u8; 20], Vec<mpsc::UnboundedSender<Vec<SocketAddr>>>>,
}

impl Subscribers {
    /// Register `reply` once; repeated searches reuse the same channel
    fn add(&mut self, info_hash: [u8; 20], reply: mpsc::UnboundedSender<Vec<SocketAddr>>) {
        let subscribers = self.by_hash.entry(info_hash).or_default();
        subscribers.retain(|s| !s.is_closed());
        if !subscribers.iter().any(|s| s.same_channel(&reply)) {
            subscribers.push(reply);
        }
    }

    fn remove(&mut self, info_hash: &[u8; 20]) {
        self.by_hash.remove(info_hash);
    }

    fn publish(&mut self, info_hash: &[u8; 20], peers: &[SocketAddr]) {
        if let Some(subscribers) = self.by_hash.get_mut(info_hash) {
            subscribers.retain(|s| s.send(peers.to_vec()).is_ok());
            if subscribers.is_empty() {
                self.by_hash.remove(info_hash);
            }
        }
    }

    fn count(&self, info_hash: &[u8; 20]) -> usize {
        self.by_hash.get(info_hash).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> DhtServiceConfig {
        let mut config = DhtServiceConfig::new("127.0.0.1:0".parse().unwrap());
        config.bootstrap = BootstrapConfig::new(Vec::new());
        config
    }

    #[tokio::test]
    async fn test_answers_ping_over_udp() {
        let handle = start(local_config()).await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ping = crate::dht::message::DHTMessage::query(
            b"p1".to_vec(),
            NodeId::random(),
            crate::dht::message::Query::Ping,
        );
        client.send_to(&ping.serialize().unwrap(), handle.local_addr()).await.unwrap();

        let mut buf = vec![0u8; MAX_PACKET];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = crate::dht::message::DHTMessage::deserialize(&buf[..len]).unwrap();
        assert_eq!(reply.transaction, b"p1".to_vec());
        match reply.body {
            crate::dht::message::Body::Response(r) => assert_eq!(r.id, Some(handle.initial_id())),
            other => panic!("unexpected {:?}", other),
        }

        handle.shutdown().await;
        assert!(handle.add_node(client.local_addr().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_state_saved_on_shutdown() {
        let path = std::env::temp_dir().join(format!("swarm-engine-dht-svc-{}.json", rand::random::<u32>()));
        let mut config = local_config();
        config.state_file = Some(path.clone());
        let handle = start(config).await.unwrap();
        handle.shutdown().await;

        let state = DhtState::load(&path).await.unwrap().unwrap();
        assert_eq!(state.node_id().unwrap(), handle.initial_id());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[test]
    fn test_repeated_search_delivers_each_batch_once() {
        let mut subscribers = Subscribers::default();
        let info_hash = [3u8; 20];
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscribers.add(info_hash, tx.clone());
        subscribers.add(info_hash, tx.clone());
        subscribers.add(info_hash, tx);
        assert_eq!(subscribers.count(&info_hash), 1);

        let peer: SocketAddr = "192.0.2.1:6881".parse().unwrap();
        subscribers.publish(&info_hash, &[peer]);
        assert_eq!(rx.try_recv().unwrap(), vec![peer]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let mut subscribers = Subscribers::default();
        let info_hash = [4u8; 20];
        let (gone, rx) = mpsc::unbounded_channel();
        subscribers.add(info_hash, gone);
        drop(rx);

        let (live, mut live_rx) = mpsc::unbounded_channel();
        subscribers.add(info_hash, live);
        assert_eq!(subscribers.count(&info_hash), 1);

        subscribers.remove(&info_hash);
        subscribers.publish(&info_hash, &["192.0.2.2:1".parse().unwrap()]);
        assert!(live_rx.try_recv().is_err());
        assert_eq!(subscribers.count(&info_hash), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_search_subscribers() {
        let handle = start(local_config()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.get_peers([5u8; 20], Some(6881), tx).unwrap();
        handle.cancel([5u8; 20]).unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(closed, None);

        handle.shutdown().await;
        assert!(handle.cancel([5u8; 20]).is_err());
    }
}
