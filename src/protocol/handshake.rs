//! Peer wire handshake
//!
//! Handles the initial handshake between peers:
//! `len(1) | protocol name | reserved(8) | info_hash(20) | peer_id(20)`.

use bytes::{Buf, BufMut, BytesMut};
use anyhow::Result;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;

/// Protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Encoded size of a handshake with the standard protocol string
pub const HANDSHAKE_LEN: usize = 1 + PROTOCOL_LENGTH as usize + 8 + 20 + 20;

/// Peer wire handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved extension bits
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with info_hash and peer_id
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating new handshake for info_hash: {}", hex::encode(info_hash));
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Create a new handshake with reserved bits set
    pub fn with_reserved(info_hash: [u8; 20], peer_id: [u8; 20], reserved: [u8; 8]) -> Self {
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID with "-SE" prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[0..3].copy_from_slice(b"-SE");
        peer_id[3..8].copy_from_slice(b"0100-");
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated new peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Append the encoded handshake to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        self.encode(&mut buf);
        trace!("Handshake serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Decode a handshake from the front of `buf` if it is complete.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while bytes are missing.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        let Some(&name_len) = buf.first() else {
            return Ok(None);
        };

        if name_len != PROTOCOL_LENGTH {
            error!("Invalid protocol length: expected {}, got {}", PROTOCOL_LENGTH, name_len);
            return Err(TorrentError::protocol_violation_at(
                format!("Invalid protocol name length {}", name_len),
                "protocol_length",
                0,
            ).into());
        }

        // Reject a wrong name as soon as its bytes are present
        let name_end = 1 + name_len as usize;
        let available = buf.len().min(name_end);
        if buf[1..available] != PROTOCOL_STRING.as_bytes()[..available - 1] {
            error!("Invalid protocol string");
            return Err(TorrentError::protocol_violation_at("Invalid protocol string", "protocol", 1).into());
        }

        if buf.len() < HANDSHAKE_LEN {
            trace!("Partial handshake: {} of {} bytes", buf.len(), HANDSHAKE_LEN);
            return Ok(None);
        }

        buf.advance(name_end);
        let mut reserved = [0u8; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0u8; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        buf.copy_to_slice(&mut peer_id);

        debug!("Handshake info_hash: {} peer_id: {}", hex::encode(info_hash), hex::encode(peer_id));
        Ok(Some(Self {
            reserved,
            info_hash,
            peer_id,
        }))
    }

    /// Deserialize a handshake from a complete byte slice
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::from(data);
        Self::decode(&mut buf)?.ok_or_else(|| {
            TorrentError::protocol_violation_at(
                format!("Handshake data too short: expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
                "handshake",
                data.len(),
            ).into()
        })
    }

    /// Validate the handshake info_hash
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake info hash mismatch: expected {} got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let handshake = Handshake::with_reserved([1u8; 20], [2u8; 20], [0, 0, 0, 0, 0, 0x10, 0, 0x01]);
        let serialized = handshake.serialize();
        assert_eq!(serialized.len(), HANDSHAKE_LEN);
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], b"BitTorrent protocol");

        let deserialized = Handshake::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, handshake);
    }

    #[test]
    fn test_decode_resumes_after_partial_input() {
        let handshake = Handshake::new([7u8; 20], [9u8; 20]);
        let bytes = handshake.serialize();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bytes[..30]);
        assert!(Handshake::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 30);

        buf.extend_from_slice(&bytes[30..]);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(Handshake::decode(&mut buf).unwrap(), Some(handshake));
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_wrong_protocol_rejected_early() {
        let mut buf = BytesMut::from(&b"\x13BitTorrent prot0"[..]);
        assert!(Handshake::decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&b"\x05hello"[..]);
        assert!(Handshake::decode(&mut buf).is_err());
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = Handshake::generate_peer_id();
        assert_eq!(&peer_id[0..3], b"-SE");
    }

    #[test]
    fn test_handshake_validate() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20]));
        assert!(!handshake.validate(&[3u8; 20]));
    }
}
