//! Client-wide tunables and protocol constants.
//!
//! Everything timing- or limit-related lives here so the torrent controller,
//! peer sessions, and strategy all read from one place.

use std::time::Duration;

/// The BitTorrent v1 protocol identifier exchanged in handshakes.
pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Client-id prefix baked into generated peer ids (Azureus style).
pub const PEER_ID_PREFIX: &[u8; 8] = b"-RP0010-";

/// Largest block a `Request`/`Cancel` may legally carry. Anything above is
/// a protocol violation and the offending peer is dropped.
pub const MAX_REQUEST_BYTES: u32 = 16 * 1024;

/// Upper bound on any length-prefixed frame we will buffer. Guards the
/// decoder against allocating for a hostile length prefix while leaving
/// room for the largest legitimate frames (a full `Piece` block, or the
/// bitfield of a torrent with millions of pieces).
pub const MAX_MESSAGE_BYTES: u32 = 2 * 1024 * 1024;

/// Runtime configuration for a client instance.
///
/// `Default` gives the values mainline clients use; the binary may
/// override the port and download root from CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port we listen on and report to trackers.
    pub port: u16,
    /// Directory under which per-torrent download directories are created.
    pub download_root: std::path::PathBuf,
    /// Ceiling on simultaneously connected peers per torrent.
    pub max_peers: usize,
    /// Maximum in-flight `Request`s per peer.
    pub max_pipeline: usize,
    /// Send a `KeepAlive` when we have been silent this long.
    pub keepalive_after: Duration,
    /// Evict a peer we have not heard from in this long.
    pub evict_after: Duration,
    /// Re-announce fallback when the tracker supplies no interval.
    pub default_announce_interval: Duration,
    /// Cadence of the controller tick (timers + strategy).
    pub tick_interval: Duration,
    /// How much we try to pull off a socket per readiness event.
    pub read_chunk: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6881,
            download_root: std::path::PathBuf::from("."),
            max_peers: 50,
            max_pipeline: 10,
            keepalive_after: Duration::from_secs(120),
            evict_after: Duration::from_secs(180),
            default_announce_interval: Duration::from_secs(1800),
            tick_interval: Duration::from_millis(50),
            read_chunk: 16 * 1024,
        }
    }
}
