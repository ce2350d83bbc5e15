//! Swarm controller
//!
//! One [`Swarm`] per active torrent. It owns the piece store, every peer
//! session, the choke scheduler, the piece picker and both bandwidth pools,
//! and mutates them only from its own task. Connection tasks report through
//! [`PeerEvent`]s; the shared listener hands over accepted peers; the DHT
//! streams discovered addresses. Timers run from [`Swarm::tick`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

use crate::cli::Config;
use crate::error::TorrentError;
use crate::peer::connection::CONNECT_TIMEOUT;
use crate::peer::{
    BlockRequest, PeerConnection, PeerEvent, PeerEventKind, PeerInfo, PeerManager, PeerSession, PeerSource,
    SessionId, SessionState,
};
use crate::protocol::{Handshake, Message};
use crate::scheduler::{BandwidthPool, ChokeScheduler, PiecePicker};
use crate::storage::backend::BlockStore;
use crate::storage::piece::{BlockKey, BlockOutcome, PieceStore, Validation, BLOCK_SIZE};
use crate::swarm::context::{Registration, RuntimeContext, BLACKLIST_DURATION};
use crate::swarm::listener::IncomingPeer;
use crate::torrent::TorrentInfo;
use crate::tracker::{AnnounceStats, Tracker, TrackerEvent};

/// Checksum failures after which a contributor is blacklisted
const MAX_HASH_FAILURES: u32 = 3;

/// Reserved-byte flag announcing DHT support
const DHT_FLAG: u8 = 0x01;

/// Lifecycle of a swarm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmState {
    Starting,
    /// Hash-checking existing data
    Validating,
    Downloading,
    Seeding,
    Stopping,
    Stopped,
    /// Swarm-fatal failure; carries the cause
    Invalid(String),
}

impl SwarmState {
    pub fn is_running(&self) -> bool {
        matches!(self, SwarmState::Downloading | SwarmState::Seeding)
    }
}

/// Snapshot published after every tick
#[derive(Debug, Clone, Default)]
pub struct SwarmStats {
    pub peers: usize,
    pub known_peers: usize,
    pub unchoked: usize,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub progress: f64,
    pub complete: bool,
}

/// Controller for one torrent
pub struct Swarm {
    torrent: TorrentInfo,
    config: Config,
    ctx: Arc<RuntimeContext>,
    registration: Option<Registration>,
    state: SwarmState,
    store: Box<dyn BlockStore>,
    pieces: PieceStore,
    peers: PeerManager,
    picker: PiecePicker,
    choker: ChokeScheduler,
    download_pool: BandwidthPool,
    upload_pool: BandwidthPool,
    tracker: Box<dyn Tracker>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    incoming_tx: mpsc::UnboundedSender<IncomingPeer>,
    incoming_rx: mpsc::UnboundedReceiver<IncomingPeer>,
    dht_tx: mpsc::UnboundedSender<Vec<SocketAddr>>,
    dht_rx: mpsc::UnboundedReceiver<Vec<SocketAddr>>,
    stats_tx: watch::Sender<SwarmStats>,
    listen_port: u16,
    downloaded: u64,
    uploaded: u64,
    last_announce: Option<Instant>,
    last_dht_search: Option<Instant>,
}

impl Swarm {
    pub fn new(
        torrent: TorrentInfo,
        config: Config,
        ctx: Arc<RuntimeContext>,
        store: Box<dyn BlockStore>,
        tracker: Box<dyn Tracker>,
    ) -> Self {
        let pieces = PieceStore::new(&torrent);
        let picker = PiecePicker::new(pieces.piece_count());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (dht_tx, dht_rx) = mpsc::unbounded_channel();
        let (stats_tx, _) = watch::channel(SwarmStats::default());

        Self {
            peers: PeerManager::new(config.max_connections),
            choker: ChokeScheduler::new(config.choke_config()),
            download_pool: BandwidthPool::new(config.download_limit, config.rate_floor),
            upload_pool: BandwidthPool::new(config.upload_limit, config.rate_floor),
            listen_port: config.listen_port,
            torrent,
            config,
            ctx,
            registration: None,
            state: SwarmState::Starting,
            store,
            pieces,
            picker,
            tracker,
            events_tx,
            events_rx,
            incoming_tx,
            incoming_rx,
            dht_tx,
            dht_rx,
            stats_tx,
            downloaded: 0,
            uploaded: 0,
            last_announce: None,
            last_dht_search: None,
        }
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.torrent.info_hash
    }

    pub fn state(&self) -> &SwarmState {
        &self.state
    }

    pub fn pieces(&self) -> &PieceStore {
        &self.pieces
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    /// Receive a fresh [`SwarmStats`] after every tick
    pub fn subscribe(&self) -> watch::Receiver<SwarmStats> {
        self.stats_tx.subscribe()
    }

    pub fn stats(&self) -> SwarmStats {
        SwarmStats {
            peers: self.peers.len(),
            known_peers: self.peers.known_count(),
            unchoked: self.peers.sessions().filter(|s| !s.am_choking).count(),
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            left: self.pieces.bytes_remaining(),
            progress: self.pieces.progress(),
            complete: self.pieces.is_complete(),
        }
    }

    fn set_state(&mut self, state: SwarmState) {
        if self.state != state {
            debug!("Swarm {}: {:?} -> {:?}", self.torrent.name, self.state, state);
            self.state = state;
        }
    }

    /// Mark the swarm invalid; the run loop shuts it down
    fn fail(&mut self, cause: &anyhow::Error) {
        error!("Swarm {} failed: {:#}", self.torrent.name, cause);
        self.state = SwarmState::Invalid(format!("{:#}", cause));
    }

    fn our_handshake(&self) -> Handshake {
        let mut reserved = [0u8; 8];
        if self.ctx.dht().is_some() {
            reserved[7] |= DHT_FLAG;
        }
        Handshake::with_reserved(self.torrent.info_hash, self.ctx.peer_id(), reserved)
    }

    fn announce_stats(&self) -> AnnounceStats {
        AnnounceStats {
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.pieces.bytes_remaining(),
        }
    }

    /// Claim the torrent, check existing data, open the listener and announce.
    ///
    /// Any failure here is swarm-fatal.
    pub async fn start(&mut self, now: Instant) -> Result<()> {
        if let Err(e) = self.try_start(now).await {
            self.fail(&e);
            return Err(e);
        }
        Ok(())
    }

    async fn try_start(&mut self, now: Instant) -> Result<()> {
        info!("Starting swarm {} ({})", self.torrent.name, self.torrent.info_hash_hex());
        self.registration = Some(self.ctx.register(self.torrent.info_hash, self.incoming_tx.clone())?);

        self.set_state(SwarmState::Validating);
        let found = self.pieces.verify_existing(&mut *self.store).await?;
        debug!("{} of {} pieces already present", found, self.pieces.piece_count());

        let addr = self
            .ctx
            .listen(self.config.listen_addr(), self.config.handshake_timeout, self.config.max_frame)
            .await?;
        self.listen_port = addr.port();

        if self.pieces.is_complete() {
            info!("{} is already complete, seeding", self.torrent.name);
            self.set_state(SwarmState::Seeding);
        } else {
            self.set_state(SwarmState::Downloading);
        }
        self.announce(TrackerEvent::Started, now).await;
        self.search_dht(now);
        Ok(())
    }

    /// Add addresses to the connection pool, skipping blacklisted ones
    pub fn add_peers(&mut self, peers: impl IntoIterator<Item = PeerInfo>, now: Instant) -> usize {
        let ctx = Arc::clone(&self.ctx);
        self.peers
            .add_peers(peers.into_iter().filter(|p| !ctx.is_banned(&p.addr.ip(), now)))
    }

    async fn announce(&mut self, event: TrackerEvent, now: Instant) {
        self.last_announce = Some(now);
        let stats = self.announce_stats();
        match self.tracker.announce(event, stats).await {
            Ok(peers) => {
                let added = self.add_peers(peers, now);
                debug!("Announce {}: {} new peers", event, added);
            }
            Err(e) => warn!("Tracker announce ({}) failed: {}", event, e),
        }
    }

    fn search_dht(&mut self, now: Instant) {
        let Some(dht) = self.ctx.dht() else {
            return;
        };
        self.last_dht_search = Some(now);
        if let Err(e) = dht.get_peers(self.torrent.info_hash, Some(self.listen_port), self.dht_tx.clone()) {
            debug!("DHT search not started: {}", e);
        }
    }

    /// Dial `info` in a new connection task
    pub fn connect(&mut self, info: PeerInfo, now: Instant) {
        let id = self.ctx.next_session_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(id, info.addr, info.source, self.pieces.piece_count(), now);
        self.peers.insert(session, tx);
        debug!("Dialing {} as {}", info.addr, id);
        tokio::spawn(PeerConnection::run_outgoing(
            id,
            info.addr,
            self.our_handshake(),
            self.config.handshake_timeout,
            self.config.max_frame,
            self.events_tx.clone(),
            rx,
        ));
    }

    /// Take over a connection routed here by the listener
    pub fn accept(&mut self, incoming: IncomingPeer, now: Instant) {
        let IncomingPeer { addr, stream, wire, handshake } = incoming;
        if !self.state.is_running() {
            debug!("Refusing {}: swarm not running", addr);
            return;
        }
        if self.ctx.is_banned(&addr.ip(), now) || self.peers.slots() == 0 {
            debug!("Refusing incoming {}", addr);
            return;
        }

        let id = self.ctx.next_session_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = PeerSession::new(id, addr, PeerSource::Incoming, self.pieces.piece_count(), now);
        session.set_state(SessionState::Handshaking);
        self.peers.insert(session, tx);

        let ours = self.our_handshake();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let mut conn = PeerConnection::from_parts(id, addr, stream, wire);
            match conn.send_handshake(&ours).await {
                Ok(()) => conn.run(events, rx).await,
                Err(e) => {
                    let _ = events.send(PeerEvent { id, kind: PeerEventKind::Closed(e.to_string()) });
                }
            }
        });
        self.on_handshake(id, handshake, now);
    }

    /// Apply one event from a connection task
    pub async fn handle_event(&mut self, event: PeerEvent, now: Instant) {
        let PeerEvent { id, kind } = event;
        match kind {
            PeerEventKind::Handshake(handshake) => self.on_handshake(id, handshake, now),
            PeerEventKind::Message(message) => {
                if let Err(e) = self.on_message(id, message, now).await {
                    self.on_error(id, e, now);
                }
            }
            PeerEventKind::Closed(reason) => self.close(id, &reason, now),
        }
        self.peers.flush();
    }

    fn on_error(&mut self, id: SessionId, err: anyhow::Error, now: Instant) {
        match err.downcast_ref::<TorrentError>() {
            Some(e) if e.is_swarm_fatal() => self.fail(&err),
            Some(e) if e.closes_session() => {
                warn!("{}: {}", id, e);
                self.close(id, &e.to_string(), now);
            }
            _ => warn!("{}: {:#}", id, err),
        }
    }

    fn on_handshake(&mut self, id: SessionId, handshake: Handshake, now: Instant) {
        if !handshake.validate(&self.torrent.info_hash) {
            self.close(id, "info hash mismatch", now);
            return;
        }
        let duplicate = handshake.peer_id == self.ctx.peer_id()
            || self.peers.find_by_peer_id(&handshake.peer_id, id).is_some();
        let dht_port = self.ctx.dht().map(|dht| dht.local_addr().port());
        let download = self.download_pool.new_allowance();
        let upload = self.upload_pool.new_allowance();

        let Some(session) = self.peers.get_mut(id) else {
            return;
        };
        session.peer_id = Some(handshake.peer_id);
        session.set_state(SessionState::Established);
        session.touch(now);
        session.download_allowance = download;
        session.upload_allowance = upload;
        if duplicate {
            warn!("{} {} repeats a connected peer id, pruning", id, session.addr);
            session.duplicate = true;
            return;
        }

        let have = self.pieces.have();
        if have.any_set() {
            session.send(Message::Bitfield { bitfield: Bytes::copy_from_slice(have.as_bytes()) }, now);
        }
        if let (Some(port), true) = (dht_port, handshake.reserved[7] & DHT_FLAG != 0) {
            session.send(Message::Port { listen_port: port }, now);
        }
        let addr = session.addr;
        info!("{} established with {}", id, addr);
        self.peers.record_success(addr, handshake.peer_id);
    }

    async fn on_message(&mut self, id: SessionId, message: Message, now: Instant) -> Result<()> {
        let Some(session) = self.peers.get_mut(id) else {
            return Ok(());
        };
        if !session.state.is_established() {
            return Err(TorrentError::protocol_violation("Message before handshake").into());
        }
        session.touch(now);
        if !matches!(message, Message::Bitfield { .. }) {
            session.close_bitfield_window();
        }

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                session.peer_choking = true;
                for request in session.clear_sent_requests() {
                    self.pieces.unassign(block_key(&request), id);
                }
            }
            Message::Unchoke => {
                session.peer_choking = false;
                self.request_blocks(id, now);
            }
            Message::Interested => session.peer_interested = true,
            Message::NotInterested => session.peer_interested = false,
            Message::Have { piece_index } => {
                if session.apply_have(piece_index)? {
                    self.picker.add_have(piece_index);
                    self.refresh_interest(id, now);
                    self.request_blocks(id, now);
                }
            }
            Message::Bitfield { bitfield } => {
                session.apply_bitfield(&bitfield)?;
                self.picker.add_bitfield(&session.pieces);
                trace!("{} has {} pieces", id, session.pieces.count_set());
                self.refresh_interest(id, now);
                self.request_blocks(id, now);
            }
            Message::Request { index, begin, length } => {
                self.pieces.check_request(index, begin, length, self.config.max_request)?;
                if session.am_choking {
                    trace!("Ignoring request {}:{} from choked {}", index, begin, id);
                    return Ok(());
                }
                let request = BlockRequest::new(index, begin, length);
                if !session.received_requests.contains(&request) {
                    session.received_requests.push_back(request);
                }
                self.serve(id, now).await?;
            }
            Message::Piece { index, begin, block } => self.on_piece(id, index, begin, block, now).await?,
            Message::Cancel { index, begin, length } => {
                session.apply_cancel(&BlockRequest::new(index, begin, length));
            }
            Message::Port { listen_port } => {
                if let Some(dht) = self.ctx.dht() {
                    let node = SocketAddr::new(session.addr.ip(), listen_port);
                    if let Err(e) = dht.add_node(node) {
                        trace!("Ignoring DHT port from {}: {}", id, e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_piece(&mut self, id: SessionId, index: u32, begin: u32, block: Bytes, now: Instant) -> Result<()> {
        let Some(session) = self.peers.get_mut(id) else {
            return Ok(());
        };
        let length = block.len() as u32;
        if session.complete_request(index, begin).is_none() {
            trace!("Unrequested block {}:{} from {}", index, begin, id);
        }
        session.download.record(length as u64, now);
        self.downloaded += length as u64;

        let outcome = match self.pieces.store_block(&mut *self.store, index, begin, &block, id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if begin % BLOCK_SIZE == 0 {
                    self.pieces.unassign(BlockKey::new(index, begin / BLOCK_SIZE), id);
                }
                return Err(e);
            }
        };

        if let BlockOutcome::Accepted { cancel, validation } = outcome {
            let request = BlockRequest::new(index, begin, length);
            for other in cancel {
                if let Some(session) = self.peers.get_mut(other) {
                    if session.cancel_request(&request, now) {
                        debug!("Cancelled duplicate {}:{} on {}", index, begin, other);
                    }
                }
            }
            match validation {
                Some(Validation::Valid) => self.on_piece_verified(index, now).await,
                Some(Validation::Invalid { contributors }) => self.on_piece_corrupt(index, contributors, now),
                None => {}
            }
        }

        self.request_blocks(id, now);
        Ok(())
    }

    async fn on_piece_verified(&mut self, piece: u32, now: Instant) {
        for session in self.peers.sessions_mut().filter(|s| s.state.is_established()) {
            session.send(Message::Have { piece_index: piece }, now);
        }
        for id in self.peers.ids() {
            self.refresh_interest(id, now);
        }
        if self.pieces.is_complete() {
            self.complete(now).await;
        }
    }

    fn on_piece_corrupt(&mut self, piece: u32, contributors: Vec<SessionId>, now: Instant) {
        let sole = contributors.len() == 1;
        for id in contributors {
            let Some(session) = self.peers.get_mut(id) else {
                continue;
            };
            session.hash_failures += 1;
            if sole || session.hash_failures >= MAX_HASH_FAILURES {
                let addr = session.addr;
                warn!("{} {} sent corrupt data for piece {}", id, addr, piece);
                self.ctx.ban(addr.ip(), now, BLACKLIST_DURATION);
                self.peers.forget(&addr);
                self.close(id, "sent corrupt data", now);
            }
        }
    }

    async fn complete(&mut self, now: Instant) {
        info!("Download of {} complete", self.torrent.name);
        self.set_state(SwarmState::Seeding);
        for session in self.peers.sessions_mut().filter(|s| s.state.is_established()) {
            session.am_interested = false;
            session.clear_sent_requests();
            session.send(Message::NotInterested, now);
        }
        self.announce(TrackerEvent::Completed, now).await;

        let seeds: Vec<SessionId> = self.peers.sessions().filter(|s| s.is_seed()).map(|s| s.id).collect();
        for id in seeds {
            self.close(id, "both sides complete", now);
        }
    }

    /// Remove a session and return everything it held
    fn close(&mut self, id: SessionId, reason: &str, now: Instant) {
        let Some(mut session) = self.peers.remove(id) else {
            return;
        };
        debug!("Closing {} {}: {}", id, session.addr, reason);
        self.pieces.release_peer(id);
        self.picker.remove_bitfield(&session.pieces);
        self.choker.remove(id);
        self.download_pool.release(&mut session.download_allowance);
        self.upload_pool.release(&mut session.upload_allowance);
        if session.peer_id.is_none() {
            self.peers.record_failure(session.addr);
        }
        trace!("{} closed after {:?}", id, now.saturating_duration_since(session.connected_at));
    }

    fn refresh_interest(&mut self, id: SessionId, now: Instant) {
        if self.state != SwarmState::Downloading {
            return;
        }
        let interested = self.peers.sessions().filter(|s| s.am_interested).count();
        let Some(session) = self.peers.get_mut(id) else {
            return;
        };
        if !session.state.is_established() || session.duplicate {
            return;
        }
        self.choker.update_interest(session, &self.pieces, interested, now);
    }

    /// Fill `id`'s request pipeline
    fn request_blocks(&mut self, id: SessionId, now: Instant) {
        if self.state != SwarmState::Downloading {
            return;
        }
        let Some(session) = self.peers.get_mut(id) else {
            return;
        };
        if !session.can_request() || session.duplicate {
            return;
        }
        let room = self.config.pipeline.saturating_sub(session.sent_requests.len());
        if room == 0 {
            return;
        }

        let picks = self.picker.pick(&self.pieces, session, room);
        for key in picks.blocks {
            let length = self.pieces.block_length(key);
            if !session.download_allowance.try_spend(length as u64) {
                trace!("{} is out of download allowance", id);
                break;
            }
            self.pieces.assign(key, id);
            session.push_request(BlockRequest::new(key.piece, key.offset(), length), now);
        }
    }

    /// Answer queued requests while the upload allowance lasts
    async fn serve(&mut self, id: SessionId, now: Instant) -> Result<()> {
        let Some(session) = self.peers.get_mut(id) else {
            return Ok(());
        };
        while let Some(&request) = session.received_requests.front() {
            if !session.upload_allowance.try_spend(request.length as u64) {
                break;
            }
            session.received_requests.pop_front();
            let block = self
                .pieces
                .read_block(&mut *self.store, request.piece, request.offset, request.length)
                .await?;
            session.upload.record(request.length as u64, now);
            self.uploaded += request.length as u64;
            session.send(Message::Piece { index: request.piece, begin: request.offset, block }, now);
        }
        Ok(())
    }

    fn check_timers(&mut self, now: Instant) {
        let seeding = self.state == SwarmState::Seeding;
        let mut doomed: Vec<(SessionId, &'static str)> = Vec::new();

        for session in self.peers.sessions_mut() {
            if session.state.is_established() {
                if session.duplicate {
                    doomed.push((session.id, "duplicate peer id"));
                } else if now.saturating_duration_since(session.last_received) >= self.config.inactivity_timeout {
                    doomed.push((session.id, "inactive"));
                } else if seeding && session.is_seed() {
                    doomed.push((session.id, "both sides complete"));
                } else if now.saturating_duration_since(session.last_sent) >= self.config.keep_alive {
                    session.send(Message::KeepAlive, now);
                }
            } else if now.saturating_duration_since(session.connected_at) >= CONNECT_TIMEOUT + self.config.handshake_timeout {
                doomed.push((session.id, "handshake timeout"));
            }

            for request in session.expire_requests(now, self.config.request_timeout) {
                debug!("Request {}:{} to {} timed out", request.piece, request.offset, session.id);
                self.pieces.unassign(block_key(&request), session.id);
            }
        }

        for (id, reason) in doomed {
            self.close(id, reason, now);
        }
    }

    fn connect_candidates(&mut self, now: Instant) {
        if self.state != SwarmState::Downloading {
            return;
        }
        let limit = self.peers.slots().min(self.config.connects_per_tick);
        if limit == 0 {
            return;
        }
        for info in self.peers.next_candidates(now, limit) {
            if self.ctx.is_banned(&info.addr.ip(), now) {
                self.peers.forget(&info.addr);
                continue;
            }
            self.connect(info, now);
        }
    }

    /// One scheduling pass: timers, choking, bandwidth, requests, uploads,
    /// new connections and periodic discovery
    pub async fn tick(&mut self, now: Instant) {
        if !self.state.is_running() {
            return;
        }
        self.check_timers(now);

        let seeding = self.state == SwarmState::Seeding;
        let mut sessions: Vec<&mut PeerSession> = self.peers.sessions_mut().collect();
        self.choker.tick(now, seeding, &mut sessions);

        self.download_pool.distribute(
            now,
            self.peers
                .sessions_mut()
                .filter(|s| s.state.is_established())
                .map(|s| (s.download.rate(now), &mut s.download_allowance)),
        );
        self.upload_pool.distribute(
            now,
            self.peers
                .sessions_mut()
                .filter(|s| s.state.is_established())
                .map(|s| (s.upload.rate(now), &mut s.upload_allowance)),
        );

        for id in self.peers.ids() {
            self.request_blocks(id, now);
            if let Err(e) = self.serve(id, now).await {
                self.on_error(id, e, now);
            }
        }

        self.connect_candidates(now);
        if self
            .last_announce
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.tracker_interval)
        {
            self.announce(TrackerEvent::Periodic, now).await;
        }
        if self
            .last_dht_search
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.dht_interval)
        {
            self.search_dht(now);
        }

        self.peers.flush();
        self.stats_tx.send_replace(self.stats());
    }

    /// Stop the swarm: tell the tracker, drop every peer, flush the store and
    /// release the torrent. An invalid swarm keeps its state.
    pub async fn shutdown(&mut self, now: Instant) {
        if self.state == SwarmState::Stopped {
            return;
        }
        if self.state.is_running() {
            self.set_state(SwarmState::Stopping);
            self.announce(TrackerEvent::Stopped, now).await;
        }
        for id in self.peers.ids() {
            self.close(id, "shutting down", now);
        }
        if let Some(dht) = self.ctx.dht() {
            if let Err(e) = dht.cancel(self.torrent.info_hash) {
                debug!("DHT search not cancelled: {}", e);
            }
        }
        if let Err(e) = self.store.flush().await {
            warn!("Flushing {} failed: {}", self.torrent.name, e);
        }
        self.registration = None;
        if !matches!(self.state, SwarmState::Invalid(_)) {
            self.set_state(SwarmState::Stopped);
        }
        info!("Swarm {} stopped", self.torrent.name);
        self.stats_tx.send_replace(self.stats());
    }

    /// Drive the swarm until `shutdown` fires or a swarm-fatal error occurs
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<SwarmStats> {
        if let Err(e) = self.start(Instant::now()).await {
            self.shutdown(Instant::now()).await;
            return Err(e);
        }
        let mut ticker = interval(self.config.tick_interval);

        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event, Instant::now()).await;
                    }
                }
                incoming = self.incoming_rx.recv() => {
                    if let Some(peer) = incoming {
                        self.accept(peer, Instant::now());
                        self.peers.flush();
                    }
                }
                found = self.dht_rx.recv() => {
                    if let Some(addrs) = found {
                        let now = Instant::now();
                        self.add_peers(addrs.into_iter().map(|a| PeerInfo::new(a, PeerSource::DHT)), now);
                    }
                }
                _ = ticker.tick() => self.tick(Instant::now()).await,
                _ = &mut shutdown => break,
            }

            if let SwarmState::Invalid(cause) = &self.state {
                let cause = cause.clone();
                self.shutdown(Instant::now()).await;
                return Err(anyhow::anyhow!("Swarm {} is invalid: {}", self.torrent.name, cause));
            }
        }

        self.shutdown(Instant::now()).await;
        Ok(self.stats())
    }
}

fn block_key(request: &BlockRequest) -> BlockKey {
    BlockKey::new(request.piece, request.offset / BLOCK_SIZE)
}
