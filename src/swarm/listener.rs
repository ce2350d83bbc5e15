//! Incoming connection listener
//!
//! One TCP listener serves every swarm of the runtime. Each accepted socket
//! gets its handshake read under a timeout and is then handed to the swarm
//! that owns the announced info-hash. Unknown torrents are disconnected.

use std::net::SocketAddr;
use std::sync::Weak;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::TorrentError;
use crate::protocol::{BitTorrentWire, Handshake, WireProtocol};
use crate::swarm::context::RuntimeContext;

/// An accepted connection whose handshake has been read
#[derive(Debug)]
pub struct IncomingPeer {
    pub addr: SocketAddr,
    pub stream: TcpStream,
    /// Carries any bytes received after the handshake
    pub wire: BitTorrentWire,
    pub handshake: Handshake,
}

pub(crate) async fn accept_loop(
    listener: TcpListener,
    ctx: Weak<RuntimeContext>,
    handshake_timeout: Duration,
    max_frame: usize,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let Some(ctx) = ctx.upgrade() else {
            debug!("Runtime gone, listener exiting");
            return;
        };
        if ctx.is_banned(&addr.ip(), Instant::now()) {
            debug!("Rejecting blacklisted peer {}", addr);
            continue;
        }
        trace!("Accepted connection from {}", addr);

        let ctx = std::sync::Arc::downgrade(&ctx);
        tokio::spawn(async move {
            if let Err(e) = route(stream, addr, ctx, handshake_timeout, max_frame).await {
                debug!("Dropped incoming {}: {}", addr, e);
            }
        });
    }
}

async fn route(
    mut stream: TcpStream,
    addr: SocketAddr,
    ctx: Weak<RuntimeContext>,
    handshake_timeout: Duration,
    max_frame: usize,
) -> Result<()> {
    let mut wire = BitTorrentWire::new(max_frame);
    let handshake = timeout(handshake_timeout, wire.read_handshake(&mut stream))
        .await
        .map_err(|_| TorrentError::timeout_for("No handshake received", addr.to_string()))??;

    let swarm = ctx
        .upgrade()
        .and_then(|ctx| ctx.route(&handshake.info_hash))
        .ok_or_else(|| {
            TorrentError::protocol_violation_field(
                format!("Unknown info hash {}", hex::encode(handshake.info_hash)),
                "info_hash",
            )
        })?;

    swarm
        .send(IncomingPeer { addr, stream, wire, handshake })
        .map_err(|_| TorrentError::network_error_with_address("Swarm is shutting down", addr.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    async fn connect_and_handshake(addr: SocketAddr, info_hash: [u8; 20]) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut wire = BitTorrentWire::default();
        wire.write_handshake(&mut stream, &Handshake::new(info_hash, [7u8; 20])).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn test_routes_by_info_hash() {
        let ctx = Arc::new(RuntimeContext::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _registration = ctx.register([5u8; 20], tx).unwrap();
        let addr = ctx
            .listen("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5), crate::protocol::DEFAULT_MAX_FRAME)
            .await
            .unwrap();

        let _stream = connect_and_handshake(addr, [5u8; 20]).await;
        let incoming = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(incoming.handshake.info_hash, [5u8; 20]);
        assert_eq!(incoming.handshake.peer_id, [7u8; 20]);
    }

    #[tokio::test]
    async fn test_unknown_info_hash_disconnected() {
        let ctx = Arc::new(RuntimeContext::new());
        let addr = ctx
            .listen("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5), crate::protocol::DEFAULT_MAX_FRAME)
            .await
            .unwrap();

        let mut stream = connect_and_handshake(addr, [6u8; 20]).await;
        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(5), stream.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
