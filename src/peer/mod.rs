//! Per-connection peer state.
//!
//! A `PeerSession` is the protocol state machine for one remote peer: the
//! handshake exchange, the four choke/interest flags, the remote's piece
//! map, the in-flight request ledgers in both directions, and the buffered
//! I/O accounting that decides when a message counts as "sent". The session
//! is sans-io: the torrent controller owns it and feeds it bytes; the
//! socket itself lives in the [`connection`] pump task.
use crate::config::MAX_REQUEST_BYTES;
use crate::wire::Handshake;
use crate::wire::Message;
use crate::wire::WireError;

use bytes::Bytes;
use bytes::BytesMut;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;

pub mod connection;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Handshake announced an unknown protocol")]
    InvalidProtocol,

    #[error("Handshake info hash does not match this torrent")]
    InfoHashMismatch,

    #[error("Bitfield length {got} does not match expected {expected}")]
    BadBitfieldLength { expected: usize, got: usize },

    #[error("Bitfield has nonzero bits past the last piece")]
    TrailingBitfieldBits,

    #[error("Bitfield received twice")]
    DuplicateBitfield,

    #[error("Request length {0} exceeds the protocol maximum")]
    OversizedRequest(u32),

    #[error("Piece index {0} out of range")]
    BadPieceIndex(u32),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;

/// Lifecycle of a session. All peers start in `AwaitingHandshake`;
/// `Dropped` is terminal.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SessionState {
    /// Neither side has completed a handshake.
    AwaitingHandshake,
    /// Ours is fully written; waiting for theirs.
    AwaitingRemoteHandshake,
    /// Both handshakes exchanged; normal messages flow.
    Active,
    /// Terminal; the socket is closed and the session is garbage.
    Dropped,
}

/// An entry in the outbound queue.
enum Outgoing {
    Handshake,
    Message(Message),
}

/// One queued outbound message with its write progress.
///
/// `handed` counts bytes passed to the transport pump, `written` counts
/// bytes the socket actually accepted. A message fires its sent-callback
/// only when `written` reaches the full encoding, and may be purged only
/// while `handed` is still zero.
struct Pending {
    payload: Outgoing,
    bytes: Bytes,
    handed: usize,
    written: usize,
}

impl Pending {
    fn is_unhanded(&self) -> bool {
        self.handed == 0
    }
}

/// Protocol state for one remote peer.
pub struct PeerSession {
    addr: SocketAddr,
    state: SessionState,
    /// Which directions of the handshake have completed.
    handshake_sent: bool,
    handshake_received: bool,
    peer_id: Option<[u8; 20]>,
    expected_info_hash: [u8; 20],

    am_choking: bool,
    am_interested: bool,
    choking_me: bool,
    interested_me: bool,

    /// Which pieces the remote claims to hold.
    has: Vec<bool>,
    bitfield_received: bool,

    /// `(piece, begin)` pairs we have fully sent and not yet seen
    /// satisfied or cancelled.
    outstanding_requests: HashSet<(u32, u32)>,
    /// `(piece, begin, length)` requests the remote sent us and we have
    /// not yet served or seen cancelled.
    wants: HashSet<(u32, u32, u32)>,

    last_heard_from: Instant,
    last_spoke_to: Instant,

    read_buf: BytesMut,
    pending_send: VecDeque<Pending>,
}

impl PeerSession {
    /// Session for a connection we initiated. The handshake still has to
    /// be enqueued by the caller.
    pub fn new_outbound(addr: SocketAddr, num_pieces: usize, info_hash: [u8; 20]) -> Self {
        Self::new(addr, num_pieces, info_hash)
    }

    /// Session for an accepted connection whose handshake was already
    /// read and validated against our torrent set.
    pub fn new_inbound(
        addr: SocketAddr,
        num_pieces: usize,
        info_hash: [u8; 20],
        remote: &Handshake,
    ) -> Self {
        let mut session = Self::new(addr, num_pieces, info_hash);
        session.handshake_received = true;
        session.peer_id = Some(remote.peer_id);
        session
    }

    fn new(addr: SocketAddr, num_pieces: usize, info_hash: [u8; 20]) -> Self {
        let now = Instant::now();
        Self {
            addr,
            state: SessionState::AwaitingHandshake,
            handshake_sent: false,
            handshake_received: false,
            peer_id: None,
            expected_info_hash: info_hash,
            // Initial flag state mandated by the protocol.
            am_choking: true,
            am_interested: false,
            choking_me: true,
            interested_me: false,
            has: vec![false; num_pieces],
            bitfield_received: false,
            outstanding_requests: HashSet::new(),
            wants: HashSet::new(),
            last_heard_from: now,
            last_spoke_to: now,
            read_buf: BytesMut::new(),
            pending_send: VecDeque::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn peer_id(&self) -> Option<[u8; 20]> {
        self.peer_id
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn choking_me(&self) -> bool {
        self.choking_me
    }

    pub fn interested_me(&self) -> bool {
        self.interested_me
    }

    pub fn has(&self) -> &[bool] {
        &self.has
    }

    pub fn outstanding_requests(&self) -> &HashSet<(u32, u32)> {
        &self.outstanding_requests
    }

    pub fn wants(&self) -> &HashSet<(u32, u32, u32)> {
        &self.wants
    }

    pub fn last_heard_from(&self) -> Instant {
        self.last_heard_from
    }

    pub fn last_spoke_to(&self) -> Instant {
        self.last_spoke_to
    }

    /// Requests sent or queued toward this peer: the pipeline-depth
    /// measure. Counts fully-written requests plus queued ones that have
    /// not completed yet.
    pub fn inflight_requests(&self) -> usize {
        let queued = self
            .pending_send
            .iter()
            .filter(|p| {
                matches!(p.payload, Outgoing::Message(Message::Request { .. }))
                    && p.written < p.bytes.len()
            })
            .count();
        self.outstanding_requests.len() + queued
    }

    /// `(piece, begin)` pairs requested from this peer, written or queued.
    pub fn requested_blocks(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let queued = self.pending_send.iter().filter_map(|p| match p.payload {
            Outgoing::Message(Message::Request { index, begin, .. }) => Some((index, begin)),
            _ => None,
        });
        self.outstanding_requests.iter().copied().chain(queued)
    }

    /// Moves the session to its terminal state. The caller is responsible
    /// for closing the transport and releasing controller-side state.
    pub fn drop_session(&mut self) {
        self.state = SessionState::Dropped;
        self.pending_send.clear();
        self.read_buf.clear();
    }

    // ---- inbound path -------------------------------------------------

    /**
    Feeds freshly read bytes into the session and drains every complete
    message.

    # How it works:
    1. Bytes accumulate in the read buffer; `last_heard_from` advances.
    2. Until the remote handshake has arrived, only a handshake may be
       parsed. A wrong protocol string or foreign info-hash is fatal.
    3. Once both handshake directions are done the session is `Active`
       and length-prefixed messages are drained FIFO. Parsing stops,
       without consuming, as soon as the buffer holds only part of the
       next frame.

    Session-local state transitions (flags, ledgers, the choke purge)
    are applied here; the returned messages are for the controller to
    route into torrent-level state.
    */
    pub fn ingest(&mut self, bytes: &[u8]) -> PeerResult<Vec<Message>> {
        if self.state == SessionState::Dropped {
            return Ok(Vec::new());
        }
        self.read_buf.extend_from_slice(bytes);
        self.last_heard_from = Instant::now();

        let mut messages = Vec::new();
        loop {
            if !self.handshake_received {
                match Handshake::parse(&mut self.read_buf)? {
                    None => break,
                    Some(handshake) => self.accept_handshake(&handshake)?,
                }
                continue;
            }
            if self.state != SessionState::Active {
                // Their handshake arrived before ours finished writing;
                // leave any further bytes buffered until we are active.
                break;
            }
            match Message::parse(&mut self.read_buf)? {
                None => break,
                Some(message) => {
                    self.apply_incoming(&message)?;
                    messages.push(message);
                }
            }
        }
        Ok(messages)
    }

    fn accept_handshake(&mut self, handshake: &Handshake) -> PeerResult<()> {
        if !handshake.is_standard_protocol() {
            return Err(PeerError::InvalidProtocol);
        }
        if handshake.info_hash != self.expected_info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        self.handshake_received = true;
        self.peer_id = Some(handshake.peer_id);
        if self.handshake_sent {
            self.state = SessionState::Active;
        }
        tracing::debug!(
            addr = %self.addr,
            peer_id = %hex::encode(handshake.peer_id),
            "Handshake received"
        );
        Ok(())
    }

    /// Session-local effect of one received message.
    fn apply_incoming(&mut self, message: &Message) -> PeerResult<()> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.choking_me = true;
                // The peer will ignore requests it has not yet seen;
                // anything we queued but never started writing is dead
                // weight and must go.
                self.purge_unwritten_requests();
            }
            Message::Unchoke => self.choking_me = false,
            Message::Interested => self.interested_me = true,
            Message::NotInterested => self.interested_me = false,
            Message::Have { piece_index } => {
                if *piece_index as usize >= self.has.len() {
                    return Err(PeerError::BadPieceIndex(*piece_index));
                }
            }
            Message::Bitfield(bits) => self.validate_bitfield(bits)?,
            Message::Request { index, begin, length } => {
                if *length > MAX_REQUEST_BYTES {
                    return Err(PeerError::OversizedRequest(*length));
                }
                self.wants.insert((*index, *begin, *length));
            }
            Message::Cancel { index, begin, length } => {
                if *length > MAX_REQUEST_BYTES {
                    return Err(PeerError::OversizedRequest(*length));
                }
                self.wants.remove(&(*index, *begin, *length));
            }
            Message::Piece { index, begin, .. } => {
                self.outstanding_requests.remove(&(*index, *begin));
            }
            Message::Port(port) => {
                tracing::trace!(addr = %self.addr, port, "Peer advertised DHT port");
            }
        }
        Ok(())
    }

    fn validate_bitfield(&mut self, bits: &[u8]) -> PeerResult<()> {
        if self.bitfield_received {
            return Err(PeerError::DuplicateBitfield);
        }
        let expected = self.has.len().div_ceil(8);
        if bits.len() != expected {
            return Err(PeerError::BadBitfieldLength { expected, got: bits.len() });
        }
        // Pad bits past the last piece must be zero.
        for i in self.has.len()..bits.len() * 8 {
            if bits[i / 8] & (0x80 >> (i % 8)) != 0 {
                return Err(PeerError::TrailingBitfieldBits);
            }
        }
        self.bitfield_received = true;
        Ok(())
    }

    /// Marks `index` as held by the peer; true when this is news.
    pub fn record_have(&mut self, index: u32) -> bool {
        let slot = &mut self.has[index as usize];
        let was_new = !*slot;
        *slot = true;
        was_new
    }

    /// Retires a want once the corresponding `Piece` has been queued.
    pub fn remove_want(&mut self, index: u32, begin: u32, length: u32) {
        self.wants.remove(&(index, begin, length));
    }

    /// Applies a validated bitfield to the has-map and returns it decoded
    /// for frequency accounting.
    pub fn apply_bitfield(&mut self, bits: &[u8]) -> Vec<bool> {
        for i in 0..self.has.len() {
            self.has[i] = bits[i / 8] & (0x80 >> (i % 8)) != 0;
        }
        self.has.clone()
    }

    // ---- outbound path ------------------------------------------------

    /// Queues our handshake. Returns true when the queue transitioned
    /// empty to non-empty (the write-interest signal).
    pub fn enqueue_handshake(&mut self, handshake: &Handshake) -> bool {
        let mut buf = BytesMut::new();
        handshake.encode(&mut buf);
        self.push_pending(Outgoing::Handshake, buf.freeze())
    }

    /// Queues a message for sending. Returns true when the queue
    /// transitioned empty to non-empty.
    pub fn enqueue(&mut self, message: Message) -> bool {
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        tracing::trace!(addr = %self.addr, kind = message.name(), "Enqueued message");
        self.push_pending(Outgoing::Message(message), buf.freeze())
    }

    fn push_pending(&mut self, payload: Outgoing, bytes: Bytes) -> bool {
        let was_empty = !self.wants_write();
        self.pending_send.push_back(Pending {
            payload,
            bytes,
            handed: 0,
            written: 0,
        });
        was_empty
    }

    /// Whether unhanded outbound bytes exist.
    pub fn wants_write(&self) -> bool {
        self.pending_send.iter().any(|p| p.handed < p.bytes.len())
    }

    /// Hands up to `max` outbound bytes to the transport, in enqueue
    /// order, possibly spanning several queued messages. Returns `None`
    /// when everything queued has already been handed off.
    pub fn next_chunk(&mut self, max: usize) -> Option<Bytes> {
        let mut chunk = BytesMut::new();
        let mut budget = max;
        for pending in self.pending_send.iter_mut() {
            if budget == 0 {
                break;
            }
            let rest = pending.bytes.len() - pending.handed;
            if rest == 0 {
                continue;
            }
            let take = rest.min(budget);
            chunk.extend_from_slice(&pending.bytes[pending.handed..pending.handed + take]);
            pending.handed += take;
            budget -= take;
        }
        if chunk.is_empty() {
            None
        } else {
            Some(chunk.freeze())
        }
    }

    /**
    Records that the socket accepted `n` more outbound bytes.

    Completion is strictly FIFO: bytes are attributed to the front of the
    queue, and each message whose encoding is now fully written fires its
    sent-callback and leaves the queue. A single write may complete
    several queued messages and leave the next one partially written.
    */
    pub fn record_written(&mut self, n: usize) {
        if n > 0 {
            self.last_spoke_to = Instant::now();
        }
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.pending_send.front_mut() else {
                tracing::warn!(addr = %self.addr, "Write progress with empty queue");
                return;
            };
            let absorbed = remaining.min(front.bytes.len() - front.written);
            front.written += absorbed;
            remaining -= absorbed;
            if front.written == front.bytes.len() {
                let sent = self.pending_send.pop_front().expect("front exists");
                self.on_sent(&sent.payload);
            }
        }
    }

    /// Sent-callback: state only changes once the whole message is out.
    fn on_sent(&mut self, payload: &Outgoing) {
        match payload {
            Outgoing::Handshake => {
                self.handshake_sent = true;
                self.state = if self.handshake_received {
                    SessionState::Active
                } else {
                    SessionState::AwaitingRemoteHandshake
                };
            }
            Outgoing::Message(message) => match message {
                Message::Choke => self.am_choking = true,
                Message::Unchoke => self.am_choking = false,
                Message::Interested => self.am_interested = true,
                Message::NotInterested => self.am_interested = false,
                Message::Request { index, begin, .. } => {
                    self.outstanding_requests.insert((*index, *begin));
                }
                Message::Cancel { index, begin, .. } => {
                    self.outstanding_requests.remove(&(*index, *begin));
                }
                _ => {}
            },
        }
    }

    /// Drops queued `Request`s that have not started toward the socket.
    /// Partially-handed messages stay; their bytes are already in the
    /// write path and recalling them would corrupt the framing.
    fn purge_unwritten_requests(&mut self) {
        self.pending_send.retain(|p| {
            !(matches!(p.payload, Outgoing::Message(Message::Request { .. }))
                && p.is_unhanded())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    const INFO_HASH: [u8; 20] = [7u8; 20];

    fn addr() -> SocketAddr {
        "10.0.0.9:6881".parse().unwrap()
    }

    fn active_session(num_pieces: usize) -> PeerSession {
        let mut session = PeerSession::new_outbound(addr(), num_pieces, INFO_HASH);
        session.enqueue_handshake(&Handshake::new(INFO_HASH, [1u8; 20]));
        let chunk = session.next_chunk(usize::MAX).unwrap();
        session.record_written(chunk.len());
        assert_eq!(session.state(), SessionState::AwaitingRemoteHandshake);

        let mut buf = BytesMut::new();
        Handshake::new(INFO_HASH, [2u8; 20]).encode(&mut buf);
        session.ingest(&buf).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        session
    }

    fn encode(message: &Message) -> Vec<u8> {
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn initial_flags_follow_the_protocol() {
        let session = PeerSession::new_outbound(addr(), 4, INFO_HASH);
        assert!(session.am_choking());
        assert!(!session.am_interested());
        assert!(session.choking_me());
        assert!(!session.interested_me());
        assert_eq!(session.state(), SessionState::AwaitingHandshake);
    }

    #[test]
    fn handshake_exchange_reaches_active() {
        let session = active_session(4);
        assert!(session.is_active());
        assert_eq!(session.peer_id(), Some([2u8; 20]));
    }

    #[test]
    fn wrong_protocol_string_is_fatal() {
        let mut session = PeerSession::new_outbound(addr(), 4, INFO_HASH);
        session.enqueue_handshake(&Handshake::new(INFO_HASH, [1u8; 20]));
        let chunk = session.next_chunk(usize::MAX).unwrap();
        session.record_written(chunk.len());

        let mut buf = BytesMut::new();
        let pstr = b"WrongProtocol";
        buf.put_u8(pstr.len() as u8);
        buf.put_slice(pstr);
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&INFO_HASH);
        buf.put_slice(&[2u8; 20]);

        assert!(matches!(
            session.ingest(&buf),
            Err(PeerError::InvalidProtocol)
        ));
    }

    #[test]
    fn foreign_info_hash_is_fatal() {
        let mut session = PeerSession::new_outbound(addr(), 4, INFO_HASH);
        session.enqueue_handshake(&Handshake::new(INFO_HASH, [1u8; 20]));
        let chunk = session.next_chunk(usize::MAX).unwrap();
        session.record_written(chunk.len());

        let mut buf = BytesMut::new();
        Handshake::new([9u8; 20], [2u8; 20]).encode(&mut buf);
        assert!(matches!(
            session.ingest(&buf),
            Err(PeerError::InfoHashMismatch)
        ));
    }

    #[test]
    fn fragmented_handshake_and_messages_parse_fifo() {
        let mut session = PeerSession::new_outbound(addr(), 4, INFO_HASH);
        session.enqueue_handshake(&Handshake::new(INFO_HASH, [1u8; 20]));
        let chunk = session.next_chunk(usize::MAX).unwrap();
        session.record_written(chunk.len());

        let mut stream = BytesMut::new();
        Handshake::new(INFO_HASH, [2u8; 20]).encode(&mut stream);
        Message::Unchoke.encode(&mut stream);
        Message::Have { piece_index: 2 }.encode(&mut stream);

        // Feed one byte at a time; the same messages must come out.
        let mut seen = Vec::new();
        for byte in stream.iter() {
            seen.extend(session.ingest(&[*byte]).unwrap());
        }
        assert_eq!(
            seen,
            vec![Message::Unchoke, Message::Have { piece_index: 2 }]
        );
        assert!(!session.choking_me());
    }

    #[test]
    fn keepalive_only_touches_timestamps() {
        let mut session = active_session(4);
        let before_flags = (
            session.am_choking(),
            session.am_interested(),
            session.choking_me(),
            session.interested_me(),
        );
        let heard_before = session.last_heard_from();
        let messages = session.ingest(&encode(&Message::KeepAlive)).unwrap();
        assert_eq!(messages, vec![Message::KeepAlive]);
        assert_eq!(
            before_flags,
            (
                session.am_choking(),
                session.am_interested(),
                session.choking_me(),
                session.interested_me(),
            )
        );
        assert!(session.last_heard_from() >= heard_before);
    }

    #[test]
    fn sent_callbacks_fire_only_after_full_write() {
        let mut session = active_session(4);
        session.enqueue(Message::Interested);
        assert!(!session.am_interested());

        let chunk = session.next_chunk(usize::MAX).unwrap();
        session.record_written(chunk.len() - 1);
        assert!(!session.am_interested(), "partial write must not flip flags");
        session.record_written(1);
        assert!(session.am_interested());
    }

    #[test]
    fn request_ledger_tracks_sends_pieces_and_cancels() {
        let mut session = active_session(4);
        session.ingest(&encode(&Message::Unchoke)).unwrap();

        session.enqueue(Message::Request { index: 0, begin: 0, length: 16384 });
        session.enqueue(Message::Request { index: 0, begin: 16384, length: 16384 });
        let chunk = session.next_chunk(usize::MAX).unwrap();
        session.record_written(chunk.len());
        assert_eq!(session.outstanding_requests().len(), 2);

        // A Piece retires its request.
        session
            .ingest(&encode(&Message::Piece { index: 0, begin: 0, block: vec![0u8; 4] }))
            .unwrap();
        assert_eq!(session.outstanding_requests().len(), 1);
        assert!(session.outstanding_requests().contains(&(0, 16384)));

        // A fully-sent Cancel retires the other.
        session.enqueue(Message::Cancel { index: 0, begin: 16384, length: 16384 });
        let chunk = session.next_chunk(usize::MAX).unwrap();
        session.record_written(chunk.len());
        assert!(session.outstanding_requests().is_empty());
    }

    #[test]
    fn choke_purges_unwritten_requests_only() {
        let mut session = active_session(8);
        session.ingest(&encode(&Message::Unchoke)).unwrap();

        let request_len = Message::Request { index: 0, begin: 0, length: 16 }.encoded_len();
        for i in 0..5u32 {
            session.enqueue(Message::Request { index: i, begin: 0, length: 16 });
        }
        // Exactly two requests make it onto the wire.
        let chunk = session.next_chunk(2 * request_len).unwrap();
        assert_eq!(chunk.len(), 2 * request_len);
        session.record_written(chunk.len());
        assert_eq!(session.outstanding_requests().len(), 2);
        assert_eq!(session.inflight_requests(), 5);

        session.ingest(&encode(&Message::Choke)).unwrap();
        assert!(session.choking_me());
        // The three unwritten requests are gone from the outbox...
        assert_eq!(session.inflight_requests(), 2);
        assert!(session.next_chunk(usize::MAX).is_none());
        // ...and the ledger holds exactly the two that were written.
        assert_eq!(
            *session.outstanding_requests(),
            HashSet::from([(0, 0), (1, 0)])
        );
    }

    #[test]
    fn choke_keeps_partially_handed_requests() {
        let mut session = active_session(8);
        session.ingest(&encode(&Message::Unchoke)).unwrap();

        session.enqueue(Message::Request { index: 0, begin: 0, length: 16 });
        session.enqueue(Message::Request { index: 1, begin: 0, length: 16 });
        // Hand off half of the first request's bytes.
        let chunk = session.next_chunk(8).unwrap();
        assert_eq!(chunk.len(), 8);

        session.ingest(&encode(&Message::Choke)).unwrap();
        // The half-handed request must still drain to keep framing valid;
        // the untouched one is purged.
        let rest = session.next_chunk(usize::MAX).unwrap();
        let request_len = Message::Request { index: 0, begin: 0, length: 16 }.encoded_len();
        assert_eq!(rest.len(), request_len - 8);
    }

    #[test]
    fn outgoing_bytes_preserve_enqueue_order() {
        let mut session = active_session(4);
        let messages = vec![
            Message::Interested,
            Message::Have { piece_index: 1 },
            Message::Request { index: 1, begin: 0, length: 16 },
        ];
        let mut expected = Vec::new();
        for m in &messages {
            expected.extend(encode(m));
            session.enqueue(m.clone());
        }

        // Drain in odd-sized chunks; concatenation must equal the
        // messages in enqueue order.
        let mut drained = Vec::new();
        while let Some(chunk) = session.next_chunk(5) {
            drained.extend_from_slice(&chunk);
        }
        assert_eq!(drained, expected);
    }

    #[test]
    fn bitfield_validation() {
        // 10 pieces -> 2 bytes, 6 pad bits.
        let mut session = active_session(10);
        assert!(matches!(
            session.ingest(&encode(&Message::Bitfield(vec![0xff]))),
            Err(PeerError::BadBitfieldLength { expected: 2, got: 1 })
        ));

        let mut session = active_session(10);
        // Bit 10 (first pad bit) set.
        assert!(matches!(
            session.ingest(&encode(&Message::Bitfield(vec![0x00, 0b0010_0000]))),
            Err(PeerError::TrailingBitfieldBits)
        ));

        let mut session = active_session(10);
        let messages = session
            .ingest(&encode(&Message::Bitfield(vec![0b1000_0001, 0b0100_0000])))
            .unwrap();
        assert_eq!(messages.len(), 1);
        let has = session.apply_bitfield(&[0b1000_0001, 0b0100_0000]);
        assert!(has[0] && has[7] && has[9]);
        assert!(!has[1] && !has[8]);

        // A second bitfield is a protocol violation.
        assert!(matches!(
            session.ingest(&encode(&Message::Bitfield(vec![0x00, 0x00]))),
            Err(PeerError::DuplicateBitfield)
        ));
    }

    #[test]
    fn oversized_request_and_cancel_are_fatal() {
        let mut session = active_session(4);
        let oversized = Message::Request {
            index: 0,
            begin: 0,
            length: MAX_REQUEST_BYTES + 1,
        };
        assert!(matches!(
            session.ingest(&encode(&oversized)),
            Err(PeerError::OversizedRequest(_))
        ));

        let mut session = active_session(4);
        let oversized = Message::Cancel {
            index: 0,
            begin: 0,
            length: MAX_REQUEST_BYTES + 1,
        };
        assert!(matches!(
            session.ingest(&encode(&oversized)),
            Err(PeerError::OversizedRequest(_))
        ));
    }

    #[test]
    fn wants_ledger_tracks_requests_and_cancels() {
        let mut session = active_session(4);
        session
            .ingest(&encode(&Message::Request { index: 2, begin: 0, length: 16 }))
            .unwrap();
        assert!(session.wants().contains(&(2, 0, 16)));
        session
            .ingest(&encode(&Message::Cancel { index: 2, begin: 0, length: 16 }))
            .unwrap();
        assert!(session.wants().is_empty());
    }

    #[test]
    fn have_for_missing_piece_index_is_fatal() {
        let mut session = active_session(4);
        assert!(matches!(
            session.ingest(&encode(&Message::Have { piece_index: 4 })),
            Err(PeerError::BadPieceIndex(4))
        ));
    }

    #[test]
    fn inbound_messages_wait_until_our_handshake_is_out() {
        // Inbound connection: their handshake is already consumed, and an
        // eager peer sends Unchoke before our reply has been written.
        let remote = Handshake::new(INFO_HASH, [2u8; 20]);
        let mut session = PeerSession::new_inbound(addr(), 4, INFO_HASH, &remote);
        assert_eq!(session.peer_id(), Some([2u8; 20]));

        session.enqueue_handshake(&Handshake::new(INFO_HASH, [1u8; 20]));
        let early = session.ingest(&encode(&Message::Unchoke)).unwrap();
        assert!(early.is_empty(), "messages must buffer until active");
        assert!(session.choking_me());

        // Our handshake drains; the buffered message parses on the next
        // (possibly empty) ingest.
        let chunk = session.next_chunk(usize::MAX).unwrap();
        session.record_written(chunk.len());
        assert_eq!(session.state(), SessionState::Active);
        let flushed = session.ingest(&[]).unwrap();
        assert_eq!(flushed, vec![Message::Unchoke]);
        assert!(!session.choking_me());
    }

    #[test]
    fn dropped_session_ignores_input() {
        let mut session = active_session(4);
        session.drop_session();
        assert_eq!(session.state(), SessionState::Dropped);
        assert!(session.ingest(&encode(&Message::Unchoke)).unwrap().is_empty());
        assert!(session.next_chunk(usize::MAX).is_none());
    }
}
