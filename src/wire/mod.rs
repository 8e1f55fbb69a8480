//! Peer wire message codec.
//!
//! After the handshake, the peer protocol is a stream of length-prefixed
//! messages: `<4-byte big-endian length><1-byte id><payload>`, with a zero
//! length denoting `KeepAlive`. Parsing is incremental over a growable
//! buffer: a short buffer yields "not yet" without consuming anything, so
//! the session can feed fragmented reads straight in.
use byteorder::BigEndian;
use byteorder::ByteOrder;
use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use thiserror::Error;

pub mod handshake;

pub use handshake::Handshake;

use crate::config::MAX_MESSAGE_BYTES;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("Bad payload length {length} for message id {id}")]
    BadLength { id: u8, length: u32 },

    #[error("Message length {0} exceeds protocol maximum")]
    Oversized(u32),

    #[error("Handshake protocol string length {0} is implausible")]
    BadHandshake(u8),
}

pub type WireResult<T> = std::result::Result<T, WireError>;

/// A peer wire message. Every variant maps to one protocol id; `KeepAlive`
/// is the id-less zero-length frame.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
}

impl Message {
    /// Protocol id of this message; `None` for `KeepAlive`.
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have { .. } => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
            Message::Port(_) => Some(9),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "KeepAlive",
            Message::Choke => "Choke",
            Message::Unchoke => "Unchoke",
            Message::Interested => "Interested",
            Message::NotInterested => "NotInterested",
            Message::Have { .. } => "Have",
            Message::Bitfield(_) => "Bitfield",
            Message::Request { .. } => "Request",
            Message::Piece { .. } => "Piece",
            Message::Cancel { .. } => "Cancel",
            Message::Port(_) => "Port",
        }
    }

    /// Total size on the wire, length prefix included.
    pub fn encoded_len(&self) -> usize {
        4 + match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len(),
            Message::Port(_) => 3,
        }
    }

    /// Appends the wire encoding of this message to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32((self.encoded_len() - 4) as u32);
        let Some(id) = self.id() else {
            return; // KeepAlive is the bare length prefix
        };
        buf.put_u8(id);
        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Request { index, begin, length }
            | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port(port) => buf.put_u16(*port),
            _ => {}
        }
    }

    /**
    Attempts to decode one message from the front of `buf`.

    Returns `Ok(None)` when the buffer holds fewer bytes than the next
    frame needs; nothing is consumed in that case and the caller simply
    feeds more bytes later. On success the frame is consumed and the typed
    message returned.

    A length prefix beyond the protocol maximum is rejected before any
    allocation happens.
    */
    pub fn parse(buf: &mut BytesMut) -> WireResult<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let length = BigEndian::read_u32(&buf[..4]);
        if length > MAX_MESSAGE_BYTES {
            return Err(WireError::Oversized(length));
        }
        if length == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if buf.len() < 4 + length as usize {
            return Ok(None);
        }

        buf.advance(4);
        let id = buf[0];
        let mut payload = buf.split_to(length as usize);
        payload.advance(1);

        let payload_len = payload.len() as u32;
        let expect = |want: u32| -> WireResult<()> {
            if payload_len != want {
                Err(WireError::BadLength { id, length: payload_len })
            } else {
                Ok(())
            }
        };

        let message = match id {
            0 => {
                expect(0)?;
                Message::Choke
            }
            1 => {
                expect(0)?;
                Message::Unchoke
            }
            2 => {
                expect(0)?;
                Message::Interested
            }
            3 => {
                expect(0)?;
                Message::NotInterested
            }
            4 => {
                expect(4)?;
                Message::Have { piece_index: BigEndian::read_u32(&payload) }
            }
            5 => Message::Bitfield(payload.to_vec()),
            6 => {
                expect(12)?;
                Message::Request {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    length: BigEndian::read_u32(&payload[8..12]),
                }
            }
            7 => {
                if payload_len < 8 {
                    return Err(WireError::BadLength { id, length: payload_len });
                }
                let index = BigEndian::read_u32(&payload[0..4]);
                let begin = BigEndian::read_u32(&payload[4..8]);
                payload.advance(8);
                Message::Piece { index, begin, block: payload.to_vec() }
            }
            8 => {
                expect(12)?;
                Message::Cancel {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    length: BigEndian::read_u32(&payload[8..12]),
                }
            }
            9 => {
                expect(2)?;
                Message::Port(BigEndian::read_u16(&payload))
            }
            other => return Err(WireError::UnknownMessageId(other)),
        };
        Ok(Some(message))
    }
}
