//! Peer wire messages
//!
//! Defines the ten message kinds exchanged after the handshake, each with an
//! explicit encoded length, encoder and decoder.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use anyhow::Result;
use tracing::{error, trace};

use crate::error::TorrentError;

/// Size of the length prefix in front of every frame
pub const LENGTH_PREFIX: usize = 4;

/// Peer wire message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => {
                error!("Invalid message ID: {}", value);
                Err(TorrentError::protocol_violation_at(
                    format!("Unknown message id {}", value),
                    "id",
                    LENGTH_PREFIX,
                ).into())
            }
        }
    }
}

/// Peer wire protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::KeepAlive => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
        }
    }

    /// Payload bytes that count against bandwidth limits
    pub fn payload_len(&self) -> usize {
        match self {
            Message::Piece { block, .. } => block.len(),
            _ => 0,
        }
    }

    /// Append the encoded frame (including length prefix) to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(LENGTH_PREFIX + self.length() as usize);
        buf.put_u32(self.length());
        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            _ => {}
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        trace!("Message {:?} serialized: {} bytes", self.message_id(), buf.len());
        buf.to_vec()
    }

    /// Decode one message from its frame body (type byte plus payload, no length prefix)
    pub fn decode_body(mut body: Bytes) -> Result<Self> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = MessageId::try_from(body.get_u8())?;
        let expect = |want: usize, body: &Bytes, field: &str| -> Result<()> {
            if body.len() != want {
                error!("{:?} payload has {} bytes, expected {}", id, body.len(), want);
                return Err(TorrentError::protocol_violation_at(
                    format!("{:?} payload has {} bytes, expected {}", id, body.len(), want),
                    field,
                    LENGTH_PREFIX + 1,
                ).into());
            }
            Ok(())
        };

        let message = match id {
            MessageId::Choke => {
                expect(0, &body, "choke")?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect(0, &body, "unchoke")?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect(0, &body, "interested")?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect(0, &body, "not_interested")?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect(4, &body, "piece_index")?;
                Message::Have { piece_index: body.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: body },
            MessageId::Request => {
                expect(12, &body, "request")?;
                Message::Request {
                    index: body.get_u32(),
                    begin: body.get_u32(),
                    length: body.get_u32(),
                }
            }
            MessageId::Piece => {
                if body.len() < 8 {
                    return Err(TorrentError::protocol_violation_at(
                        format!("Piece message too short: {} bytes", body.len()),
                        "piece",
                        LENGTH_PREFIX + 1,
                    ).into());
                }
                let index = body.get_u32();
                let begin = body.get_u32();
                Message::Piece { index, begin, block: body }
            }
            MessageId::Cancel => {
                expect(12, &body, "cancel")?;
                Message::Cancel {
                    index: body.get_u32(),
                    begin: body.get_u32(),
                    length: body.get_u32(),
                }
            }
            MessageId::Port => {
                expect(2, &body, "listen_port")?;
                Message::Port { listen_port: body.get_u16() }
            }
        };

        trace!("Decoded message {:?}", message.message_id());
        Ok(message)
    }

    /// Deserialize a complete frame (including length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < LENGTH_PREFIX {
            return Err(TorrentError::protocol_violation_field("Frame shorter than length prefix", "length").into());
        }
        let mut buf = Bytes::copy_from_slice(data);
        let length = buf.get_u32() as usize;
        if buf.len() != length {
            return Err(TorrentError::protocol_violation_at(
                format!("Declared length {} but {} bytes follow", length, buf.len()),
                "length",
                0,
            ).into());
        }
        Self::decode_body(buf)
    }
}
