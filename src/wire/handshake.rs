//! The BitTorrent peer handshake.
//!
//! The handshake is the first thing each side sends. It establishes that
//! both peers speak the same protocol and are talking about the same
//! torrent (via the info-hash), and carries each side's peer id.
use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;

use super::WireResult;
use crate::config::PROTOCOL;

/** A handshake message: fixed layout `1 + pstrlen + 8 + 20 + 20` bytes.

Fields in wire order:
- protocol string length (one byte) and the protocol string itself
- eight reserved bytes (all zero; extensions are not negotiated here)
- the torrent's info-hash
- the sender's peer id */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub pstr: Vec<u8>,
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /** Creates our side of the handshake for a torrent.

    Arguments:
    - info_hash - SHA-1 of the torrent's info dictionary
    - peer_id - this client's identity

    The protocol string is the BitTorrent v1 default and the reserved
    bytes are zero. */
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            pstr: PROTOCOL.to_vec(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Whether the remote announced the protocol we speak.
    pub fn is_standard_protocol(&self) -> bool {
        self.pstr == PROTOCOL
    }

    /// Size on the wire.
    pub fn encoded_len(&self) -> usize {
        49 + self.pstr.len()
    }

    /// Appends the wire encoding to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.pstr.len() as u8);
        buf.put_slice(&self.pstr);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
    }

    /**
    Attempts to decode a handshake from the front of `buf`.

    Returns `Ok(None)` while the buffer is shorter than the full
    `1 + pstrlen + 48` layout, consuming nothing; the caller feeds more
    bytes as they arrive. The protocol string is *not* validated here -
    the session compares it against the expected protocol and drops the
    peer on mismatch, which keeps the parser usable in tests that
    deliberately send the wrong string.
    */
    pub fn parse(buf: &mut BytesMut) -> WireResult<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let pstrlen = buf[0] as usize;
        let total = 1 + pstrlen + 8 + 20 + 20;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(1);
        let pstr = buf.split_to(pstrlen).to_vec();
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf.split_to(8));
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf.split_to(20));
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf.split_to(20));

        Ok(Some(Handshake { pstr, reserved, info_hash, peer_id }))
    }
}
