//! Peer connection module
//!
//! Socket side of a session. Each connection runs in its own task, reports
//! everything it reads to the owning swarm as [`PeerEvent`]s and writes
//! whatever the swarm queues on its outgoing channel.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::SessionId;
use crate::protocol::{BitTorrentWire, Handshake, Message, WireProtocol};

/// Default TCP connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a connection task reports to its swarm
#[derive(Debug)]
pub enum PeerEventKind {
    /// Handshake exchanged and info-hash verified
    Handshake(Handshake),
    Message(Message),
    /// Connection ended; terminal
    Closed(String),
}

/// Event from a connection task
#[derive(Debug)]
pub struct PeerEvent {
    pub id: SessionId,
    pub kind: PeerEventKind,
}

/// Outgoing half handed to the swarm
pub type PeerSender = mpsc::UnboundedSender<Message>;

/// Represents a connected peer socket
pub struct PeerConnection {
    id: SessionId,
    addr: SocketAddr,
    stream: TcpStream,
    wire: BitTorrentWire,
}

impl PeerConnection {
    /// Wrap an accepted socket whose handshake was already read into `wire`
    pub fn from_parts(id: SessionId, addr: SocketAddr, stream: TcpStream, wire: BitTorrentWire) -> Self {
        Self { id, addr, stream, wire }
    }

    /// Connect to a peer at the given address
    pub async fn connect(id: SessionId, addr: SocketAddr, max_frame: usize) -> Result<Self> {
        info!("Connecting to peer: {}", addr);

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                warn!("Connection timeout to {}", addr);
                TorrentError::timeout_for("Connection timeout", addr.to_string())
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", addr, e);
                TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;

        debug!("Connected to peer: {}", addr);
        Ok(Self::from_parts(id, addr, stream, BitTorrentWire::new(max_frame)))
    }

    /// Send our handshake
    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<()> {
        self.wire.write_handshake(&mut self.stream, handshake).await.map_err(|e| {
            TorrentError::network_error_full("Failed to send handshake", self.addr.to_string(), e.to_string()).into()
        })
    }

    /// Read the remote handshake and check its info-hash
    pub async fn receive_handshake(&mut self, info_hash: &[u8; 20], limit: Duration) -> Result<Handshake> {
        let handshake = timeout(limit, self.wire.read_handshake(&mut self.stream))
            .await
            .map_err(|_| TorrentError::timeout_for("No handshake received", self.addr.to_string()))??;

        if !handshake.validate(info_hash) {
            return Err(TorrentError::protocol_violation_field(
                format!("Info hash mismatch from {}", self.addr),
                "info_hash",
            ).into());
        }
        Ok(handshake)
    }

    /// Full outgoing setup: connect, exchange handshakes, then run the I/O loop
    pub async fn run_outgoing(
        id: SessionId,
        addr: SocketAddr,
        ours: Handshake,
        handshake_timeout: Duration,
        max_frame: usize,
        events: mpsc::UnboundedSender<PeerEvent>,
        outgoing: mpsc::UnboundedReceiver<Message>,
    ) {
        let setup = async {
            let mut conn = Self::connect(id, addr, max_frame).await?;
            conn.send_handshake(&ours).await?;
            let theirs = conn.receive_handshake(&ours.info_hash, handshake_timeout).await?;
            Ok::<_, anyhow::Error>((conn, theirs))
        };

        match setup.await {
            Ok((conn, theirs)) => {
                if events.send(PeerEvent { id, kind: PeerEventKind::Handshake(theirs) }).is_ok() {
                    conn.run(events, outgoing).await;
                }
            }
            Err(e) => {
                let _ = events.send(PeerEvent { id, kind: PeerEventKind::Closed(e.to_string()) });
            }
        }
    }

    /// Pump messages until either side closes
    pub async fn run(mut self, events: mpsc::UnboundedSender<PeerEvent>, mut outgoing: mpsc::UnboundedReceiver<Message>) {
        let (mut reader, mut writer) = self.stream.into_split();
        let mut write_buf = bytes::BytesMut::new();
        let id = self.id;

        let reason = loop {
            tokio::select! {
                incoming = self.wire.read_message(&mut reader) => match incoming {
                    Ok(message) => {
                        trace!("{} -> {:?}", id, message.message_id());
                        if events.send(PeerEvent { id, kind: PeerEventKind::Message(message) }).is_err() {
                            break "swarm gone".to_string();
                        }
                    }
                    Err(e) => break e.to_string(),
                },
                queued = outgoing.recv() => match queued {
                    Some(message) => {
                        write_buf.clear();
                        message.encode(&mut write_buf);
                        // Coalesce whatever else is already queued
                        while let Ok(next) = outgoing.try_recv() {
                            next.encode(&mut write_buf);
                        }
                        if let Err(e) = writer.write_all(&write_buf).await {
                            error!("Write to {} failed: {}", self.addr, e);
                            break e.to_string();
                        }
                    }
                    None => {
                        let _ = writer.shutdown().await;
                        debug!("{} closed by swarm", id);
                        return;
                    }
                },
            }
        };

        debug!("{} {} closed: {}", id, self.addr, reason);
        let _ = events.send(PeerEvent { id, kind: PeerEventKind::Closed(reason) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_outgoing_handshake_and_message_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [3u8; 20];

        let remote = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut wire = BitTorrentWire::default();
            let theirs = wire.read_handshake(&mut stream).await.unwrap();
            wire.write_handshake(&mut stream, &Handshake::new(theirs.info_hash, [8u8; 20])).await.unwrap();
            wire.write_message(&mut stream, &Message::Unchoke).await.unwrap();
            assert_eq!(wire.read_message(&mut stream).await.unwrap(), Message::Interested);
        });

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(PeerConnection::run_outgoing(
            SessionId(1),
            addr,
            Handshake::new(info_hash, [1u8; 20]),
            Duration::from_secs(5),
            crate::protocol::DEFAULT_MAX_FRAME,
            event_tx,
            out_rx,
        ));

        match event_rx.recv().await.unwrap().kind {
            PeerEventKind::Handshake(h) => assert_eq!(h.peer_id, [8u8; 20]),
            other => panic!("unexpected {:?}", other),
        }
        match event_rx.recv().await.unwrap().kind {
            PeerEventKind::Message(m) => assert_eq!(m, Message::Unchoke),
            other => panic!("unexpected {:?}", other),
        }
        out_tx.send(Message::Interested).unwrap();
        remote.await.unwrap();

        assert!(matches!(event_rx.recv().await.unwrap().kind, PeerEventKind::Closed(_)));
    }

    #[tokio::test]
    async fn test_info_hash_mismatch_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut wire = BitTorrentWire::default();
            let _ = wire.read_handshake(&mut stream).await;
            let _ = wire.write_handshake(&mut stream, &Handshake::new([9u8; 20], [8u8; 20])).await;
        });

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        PeerConnection::run_outgoing(
            SessionId(2),
            addr,
            Handshake::new([3u8; 20], [1u8; 20]),
            Duration::from_secs(5),
            crate::protocol::DEFAULT_MAX_FRAME,
            event_tx,
            out_rx,
        )
        .await;

        match event_rx.recv().await.unwrap().kind {
            PeerEventKind::Closed(reason) => assert!(reason.contains("Info hash mismatch")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
