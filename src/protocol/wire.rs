//! Wire protocol framing
//!
//! Resumable framing over a growable buffer. A frame that has only partly
//! arrived stays buffered until its declared length is available, so reads
//! can be suspended (or cancelled by `select!`) anywhere mid-message.

use bytes::{Buf, BytesMut};
use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, trace};

use crate::error::TorrentError;
use super::handshake::Handshake;
use super::message::{Message, LENGTH_PREFIX};

/// Default cap on a single frame: a 1 MiB block plus piece header
pub const DEFAULT_MAX_FRAME: usize = (1 << 20) + 13;

/// Splits a byte stream into frames and decodes them
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameDecoder {
    /// Create a decoder rejecting frames longer than `max_frame`
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Decode the next message if a complete frame is buffered
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > self.max_frame {
            error!("Frame length {} exceeds limit {}", length, self.max_frame);
            return Err(TorrentError::protocol_violation_at(
                format!("Frame length {} exceeds limit {}", length, self.max_frame),
                "length",
                0,
            ).into());
        }

        if buf.len() < LENGTH_PREFIX + length {
            buf.reserve(LENGTH_PREFIX + length - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX);
        let body = buf.split_to(length).freeze();
        trace!("Framed {} byte message", length);
        Message::decode_body(body).map(Some)
    }

    /// Decode a handshake if one is completely buffered
    pub fn decode_handshake(&self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        Handshake::decode(buf)
    }
}

/// WireProtocol trait for stream-level protocol I/O
pub trait WireProtocol {
    /// Read a complete message from the stream
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message>;

    /// Write a message to the stream
    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Buffered implementation of WireProtocol.
///
/// Bytes read but not yet consumed survive across calls, which makes
/// `read_message` safe to race against timers.
#[derive(Debug, Default)]
pub struct BitTorrentWire {
    decoder: FrameDecoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl BitTorrentWire {
    /// Create a wire with the given frame limit
    pub fn new(max_frame: usize) -> Self {
        Self {
            decoder: FrameDecoder::new(max_frame),
            read_buf: BytesMut::with_capacity(32 * 1024),
            write_buf: BytesMut::new(),
        }
    }

    /// Bytes received but not yet decoded
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }

    async fn fill<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<()> {
        let n = reader.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Err(TorrentError::network_error("Connection closed by peer").into());
        }
        Ok(())
    }
}

impl WireProtocol for BitTorrentWire {
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message> {
        loop {
            if let Some(message) = self.decoder.decode(&mut self.read_buf)? {
                return Ok(message);
            }
            self.fill(reader).await?;
        }
    }

    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        self.write_buf.clear();
        message.encode(&mut self.write_buf);
        writer.write_all(&self.write_buf).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        loop {
            if let Some(handshake) = self.decoder.decode_handshake(&mut self.read_buf)? {
                return Ok(handshake);
            }
            self.fill(reader).await?;
        }
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        self.write_buf.clear();
        handshake.encode(&mut self.write_buf);
        writer.write_all(&self.write_buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_decode_incomplete_then_complete() {
        let decoder = FrameDecoder::default();
        let frame = Message::Request { index: 3, begin: 0, length: 16384 }.serialize();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame[..2]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[2..9]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[9..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Message::Request { index: 3, begin: 0, length: 16384 })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_keepalive_and_back_to_back_frames() {
        let decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        Message::KeepAlive.encode(&mut buf);
        Message::Have { piece_index: 5 }.encode(&mut buf);

        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Message::Have { piece_index: 5 }));
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let decoder = FrameDecoder::new(64);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1000u32.to_be_bytes());
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_wire_handshake_then_messages() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let handshake = Handshake::new([4u8; 20], [5u8; 20]);
        let piece = Message::Piece { index: 1, begin: 0, block: Bytes::from(vec![9u8; 300]) };

        let sent = piece.clone();
        let writer = tokio::spawn(async move {
            let mut wire = BitTorrentWire::default();
            wire.write_handshake(&mut a, &Handshake::new([4u8; 20], [5u8; 20])).await.unwrap();
            wire.write_message(&mut a, &Message::Interested).await.unwrap();
            wire.write_message(&mut a, &sent).await.unwrap();
        });

        let mut wire = BitTorrentWire::default();
        assert_eq!(wire.read_handshake(&mut b).await.unwrap(), handshake);
        assert_eq!(wire.read_message(&mut b).await.unwrap(), Message::Interested);
        assert_eq!(wire.read_message(&mut b).await.unwrap(), piece);
        writer.await.unwrap();
    }
}
