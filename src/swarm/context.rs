//! Runtime context shared by every swarm in the process
//!
//! Holds what would otherwise be process-wide singletons: the local peer id,
//! the shared TCP listener and its info-hash routes, the address blacklist,
//! the active-torrent registry and an optional DHT handle. Created on first
//! [`Runtime::acquire`] and released when the last swarm drops its handle.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dht::DhtHandle;
use crate::error::TorrentError;
use crate::peer::SessionId;
use crate::protocol::Handshake;
use crate::swarm::listener::{accept_loop, IncomingPeer};

/// How long a misbehaving address stays banned
pub const BLACKLIST_DURATION: Duration = Duration::from_secs(60 * 60);

static RUNTIME: Mutex<Weak<RuntimeContext>> = Mutex::new(Weak::new());

/// Entry point for obtaining the shared context
pub struct Runtime;

impl Runtime {
    /// Return the live context, creating it if no swarm holds one
    pub fn acquire() -> Arc<RuntimeContext> {
        let mut slot = RUNTIME.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ctx) = slot.upgrade() {
            return ctx;
        }
        let ctx = Arc::new(RuntimeContext::new());
        *slot = Arc::downgrade(&ctx);
        ctx
    }
}

struct Listener {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

/// State shared between the swarms of one process
pub struct RuntimeContext {
    peer_id: [u8; 20],
    next_session: AtomicU64,
    routes: Mutex<HashMap<[u8; 20], mpsc::UnboundedSender<IncomingPeer>>>,
    blacklist: Mutex<HashMap<IpAddr, Instant>>,
    listener: Mutex<Option<Listener>>,
    dht: Mutex<Option<DhtHandle>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl RuntimeContext {
    /// Create a standalone context; most callers want [`Runtime::acquire`]
    pub fn new() -> Self {
        let peer_id = Handshake::generate_peer_id();
        info!("Runtime context created, peer id {}", hex::encode(peer_id));
        Self {
            peer_id,
            next_session: AtomicU64::new(1),
            routes: Mutex::new(HashMap::new()),
            blacklist: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            dht: Mutex::new(None),
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::Relaxed))
    }

    /// Claim `info_hash` for one swarm; incoming peers for it go to `incoming`.
    ///
    /// A second registration of the same torrent fails until the first
    /// [`Registration`] is dropped.
    pub fn register(
        self: &Arc<Self>,
        info_hash: [u8; 20],
        incoming: mpsc::UnboundedSender<IncomingPeer>,
    ) -> Result<Registration> {
        let mut routes = locked(&self.routes);
        if routes.contains_key(&info_hash) {
            error!("Torrent {} is already active", hex::encode(info_hash));
            return Err(TorrentError::metadata_error_with_source(
                "Torrent is already active",
                hex::encode(info_hash),
            ).into());
        }
        routes.insert(info_hash, incoming);
        debug!("Registered torrent {} ({} active)", hex::encode(info_hash), routes.len());
        Ok(Registration {
            ctx: Arc::clone(self),
            info_hash,
        })
    }

    /// Whether a swarm currently owns `info_hash`
    pub fn is_active(&self, info_hash: &[u8; 20]) -> bool {
        locked(&self.routes).contains_key(info_hash)
    }

    pub fn active_count(&self) -> usize {
        locked(&self.routes).len()
    }

    /// Channel of the swarm that owns `info_hash`
    pub(crate) fn route(&self, info_hash: &[u8; 20]) -> Option<mpsc::UnboundedSender<IncomingPeer>> {
        locked(&self.routes).get(info_hash).cloned()
    }

    fn unregister(&self, info_hash: &[u8; 20]) {
        if locked(&self.routes).remove(info_hash).is_some() {
            debug!("Unregistered torrent {}", hex::encode(info_hash));
        }
    }

    /// Ban `ip` until `now + duration`
    pub fn ban(&self, ip: IpAddr, now: Instant, duration: Duration) {
        warn!("Blacklisting {} for {:?}", ip, duration);
        locked(&self.blacklist).insert(ip, now + duration);
    }

    /// Whether `ip` is banned at `now`; expired entries are dropped
    pub fn is_banned(&self, ip: &IpAddr, now: Instant) -> bool {
        let mut blacklist = locked(&self.blacklist);
        match blacklist.get(ip) {
            Some(until) if now < *until => true,
            Some(_) => {
                blacklist.remove(ip);
                false
            }
            None => false,
        }
    }

    /// Start the shared listener unless it is already running.
    ///
    /// Returns the bound address.
    pub async fn listen(
        self: &Arc<Self>,
        bind: SocketAddr,
        handshake_timeout: Duration,
        max_frame: usize,
    ) -> Result<SocketAddr> {
        if let Some(addr) = self.listen_addr() {
            return Ok(addr);
        }
        let listener = TcpListener::bind(bind).await.map_err(|e| {
            error!("Failed to bind listener to {}: {}", bind, e);
            TorrentError::network_error_full("Failed to bind listener", bind.to_string(), e.to_string())
        })?;
        let addr = listener.local_addr()?;

        let mut slot = locked(&self.listener);
        if let Some(existing) = slot.as_ref() {
            // Lost a race with another swarm; keep theirs
            return Ok(existing.addr);
        }
        let task = tokio::spawn(accept_loop(listener, Arc::downgrade(self), handshake_timeout, max_frame));
        *slot = Some(Listener { addr, task });
        info!("Listening for peers on {}", addr);
        Ok(addr)
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        locked(&self.listener).as_ref().map(|l| l.addr)
    }

    pub fn set_dht(&self, handle: DhtHandle) {
        *locked(&self.dht) = Some(handle);
    }

    pub fn dht(&self) -> Option<DhtHandle> {
        locked(&self.dht).clone()
    }

    pub fn take_dht(&self) -> Option<DhtHandle> {
        locked(&self.dht).take()
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        if let Some(listener) = locked(&self.listener).take() {
            listener.task.abort();
        }
        debug!("Runtime context released");
    }
}

/// Ownership of an info-hash in the registry; releases it on drop
pub struct Registration {
    ctx: Arc<RuntimeContext>,
    info_hash: [u8; 20],
}

impl Registration {
    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.ctx.unregister(&self.info_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_rejected() {
        let ctx = Arc::new(RuntimeContext::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = ctx.register([1u8; 20], tx.clone()).unwrap();
        let err = ctx.register([1u8; 20], tx.clone()).err().unwrap();
        assert!(err.downcast_ref::<TorrentError>().unwrap().is_swarm_fatal());

        drop(first);
        assert!(!ctx.is_active(&[1u8; 20]));
        assert!(ctx.register([1u8; 20], tx).is_ok());
    }

    #[test]
    fn test_blacklist_expires() {
        let ctx = RuntimeContext::new();
        let now = Instant::now();
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        ctx.ban(ip, now, BLACKLIST_DURATION);
        assert!(ctx.is_banned(&ip, now + Duration::from_secs(60)));
        assert!(!ctx.is_banned(&ip, now + BLACKLIST_DURATION));
        assert!(!ctx.is_banned(&"10.1.2.4".parse().unwrap(), now));
    }

    #[test]
    fn test_session_ids_unique() {
        let ctx = RuntimeContext::new();
        assert_ne!(ctx.next_session_id(), ctx.next_session_id());
    }

    #[test]
    fn test_acquire_shares_until_released() {
        let a = Runtime::acquire();
        let b = Runtime::acquire();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.peer_id(), b.peer_id());
    }
}
