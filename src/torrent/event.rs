//! Torrent-level events.
//!
//! One enum covers everything the controller can announce to interested
//! parties; the strategy subscribes to all of it. The original layering of
//! separate manager classes collapses into this single routing point.
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A tracker answered an announce with fresh peer addresses.
    TrackerResponse { url: String, peers: Vec<SocketAddr> },
    /// A tracker reported failure (HTTP error, failure reason, warning).
    TrackerFailure { url: String, reason: String },
    /// A connection completed its handshake exchange.
    PeerConnected(SocketAddr),
    /// A session reached its terminal state and was discarded.
    PeerDropped(SocketAddr),
    /// A piece was assembled and its hash verified.
    HaveCompletePiece(u32),
    /// A piece assembled but failed verification; its blocks were
    /// discarded.
    HashMismatch(u32),
    /// Every piece is verified.
    DownloadComplete,
}
