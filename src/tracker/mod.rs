//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with HTTP trackers: building
//! announce requests (with the raw-byte URL encoding the protocol
//! requires), parsing bencoded responses in both compact and dictionary
//! peer formats, and scheduling re-announces. Tracker failures never stop
//! a torrent; the controller logs them and retries at the scheduled
//! interval.
use rand::Rng;
use serde::Deserialize;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::config::PEER_ID_PREFIX;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Tracker returned failure: {0}")]
    Failure(String),

    #[error("Url parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bencode deserialization error: {0}")]
    Bencode(#[from] serde_bencode::Error),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// The event reported alongside an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
    /// A periodic re-announce; no event parameter is sent.
    None,
}

impl AnnounceEvent {
    fn as_param(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::None => None,
        }
    }
}

/// Parameters for one announce request.
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    /// Echoed back when a prior response supplied one.
    pub trackerid: Option<String>,
    pub numwant: Option<u32>,
    pub key: Option<String>,
}

/// A peer received from the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// The parsed, non-failure response to an announce.
#[derive(Debug)]
pub struct AnnounceResponse {
    pub interval: Option<Duration>,
    pub min_interval: Option<Duration>,
    pub tracker_id: Option<String>,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(rename = "warning message")]
    warning_message: Option<String>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(rename = "min interval")]
    min_interval: Option<i64>,
    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,
    #[serde(default)]
    peers: Peers,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(#[serde(with = "serde_bytes")] Vec<u8>),
    NonCompact(Vec<PeerDict>),
}

impl Default for Peers {
    fn default() -> Self {
        Peers::Compact(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

/// Per-tracker announce state, one record per known announce URL.
#[derive(Debug)]
pub struct Tracker {
    pub announce_url: String,
    pub interval: Option<Duration>,
    pub min_interval: Option<Duration>,
    pub trackerid: Option<String>,
    pub active: bool,
    /// Consecutive failed announces; informational only.
    pub failures: u32,
}

impl Tracker {
    pub fn new(announce_url: String) -> Self {
        Self {
            announce_url,
            interval: None,
            min_interval: None,
            trackerid: None,
            active: false,
            failures: 0,
        }
    }

    /// Absorbs interval and identity data from a successful response.
    pub fn note_response(&mut self, response: &AnnounceResponse) {
        self.active = true;
        self.failures = 0;
        self.interval = response.interval;
        self.min_interval = response.min_interval;
        if response.tracker_id.is_some() {
            self.trackerid = response.tracker_id.clone();
        }
    }

    pub fn note_failure(&mut self) {
        self.failures += 1;
    }

    /// Delay until the next announce: the larger of the tracker's two
    /// intervals, or the caller's default when it supplied neither.
    pub fn next_announce_delay(&self, default: Duration) -> Duration {
        match (self.min_interval, self.interval) {
            (None, None) => default,
            (min, interval) => min.unwrap_or(Duration::ZERO).max(interval.unwrap_or(Duration::ZERO)),
        }
    }

    /// The scrape URL this tracker implies, if it follows the convention:
    /// the last path segment `announce` swaps for `scrape`. A tracker
    /// whose announce URL is shaped differently does not support scrape.
    pub fn scrape_url(&self) -> Option<String> {
        let slash = self.announce_url.rfind('/')?;
        let segment = &self.announce_url[slash + 1..];
        if segment.starts_with("announce") {
            Some(format!(
                "{}scrape{}",
                &self.announce_url[..slash + 1],
                &segment["announce".len()..]
            ))
        } else {
            None
        }
    }
}

/// Swarm statistics for one torrent, from a scrape response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScrapeStats {
    /// Peers with the complete file (seeders).
    #[serde(default)]
    pub complete: u32,
    /// Total completed downloads ever reported.
    #[serde(default)]
    pub downloaded: u32,
    /// Peers still leeching.
    #[serde(default)]
    pub incomplete: u32,
}

#[derive(Debug, Deserialize)]
struct RawScrapeResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    files: std::collections::HashMap<serde_bytes::ByteBuf, ScrapeStats>,
}

/// Asks the tracker how the swarm for `info_hash` looks without
/// announcing ourselves. Only meaningful for trackers whose URL supports
/// the scrape convention; see [`Tracker::scrape_url`].
#[tracing::instrument(level = "debug", skip(info_hash))]
pub async fn scrape(scrape_url: &str, info_hash: [u8; 20]) -> TrackerResult<ScrapeStats> {
    let mut url = url::Url::parse(scrape_url)?;
    let query = format!("info_hash={}", url_encode(&info_hash));
    match url.query() {
        Some(existing) => url.set_query(Some(&format!("{}&{}", existing, query))),
        None => url.set_query(Some(&query)),
    }

    let response = reqwest::get(url).await?;
    let body = response.bytes().await?;
    parse_scrape_response(&body, info_hash)
}

fn parse_scrape_response(bytes: &[u8], info_hash: [u8; 20]) -> TrackerResult<ScrapeStats> {
    let raw: RawScrapeResponse = serde_bencode::from_bytes(bytes)?;
    if let Some(reason) = raw.failure_reason {
        return Err(TrackerError::Failure(reason));
    }
    raw.files
        .into_iter()
        .find(|(key, _)| key.as_ref() as &[u8] == info_hash.as_slice())
        .map(|(_, stats)| stats)
        .ok_or_else(|| TrackerError::Failure("scrape response missing our torrent".to_string()))
}

/**
Performs one announce round-trip.

# How it works:
1. Builds the query string by hand: `info_hash` and `peer_id` are raw
   bytes and must be percent-encoded byte-by-byte, which stock URL query
   builders would re-escape.
2. Issues the GET and reads the bencoded body.
3. A body carrying `failure reason` or `warning message` becomes a
   `TrackerError::Failure`; anything else parses into peers and
   scheduling intervals.
*/
#[tracing::instrument(level = "debug", skip(request))]
pub async fn announce(
    announce_url: &str,
    request: &AnnounceRequest,
) -> TrackerResult<AnnounceResponse> {
    let mut url = url::Url::parse(announce_url)?;

    let mut query = String::new();
    let mut push = |key: &str, value: String| {
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(key);
        query.push('=');
        query.push_str(&value);
    };
    push("info_hash", url_encode(&request.info_hash));
    push("peer_id", url_encode(&request.peer_id));
    push("port", request.port.to_string());
    push("uploaded", request.uploaded.to_string());
    push("downloaded", request.downloaded.to_string());
    push("left", request.left.to_string());
    push("compact", "1".to_string());
    if let Some(event) = request.event.as_param() {
        push("event", event.to_string());
    }
    if let Some(trackerid) = &request.trackerid {
        push("trackerid", url_encode(trackerid.as_bytes()));
    }
    if let Some(numwant) = request.numwant {
        push("numwant", numwant.to_string());
    }
    if let Some(key) = &request.key {
        push("key", url_encode(key.as_bytes()));
    }
    // Preserve any query the announce URL itself carries.
    if let Some(existing) = url.query() {
        query = format!("{}&{}", existing, query);
    }
    url.set_query(Some(&query));

    tracing::debug!(%url, "Making announce request to tracker");
    let response = reqwest::get(url).await?;
    let body = response.bytes().await?;
    parse_announce_response(&body)
}

/// Parses the bencoded body of a tracker announce response.
///
/// Handles both peer list shapes the protocol allows:
/// - **Compact**: a byte string, each 6-byte record is a big-endian IPv4
///   address and port.
/// - **Dictionary list**: one dict per peer with `ip` and `port`.
fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    let raw: RawResponse = serde_bencode::from_bytes(bytes)?;

    if let Some(reason) = raw.failure_reason {
        return Err(TrackerError::Failure(reason));
    }
    if let Some(warning) = raw.warning_message {
        return Err(TrackerError::Failure(warning));
    }

    let peers = match raw.peers {
        Peers::Compact(bytes) => bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                Peer { ip: IpAddr::V4(ip), port }
            })
            .collect(),
        Peers::NonCompact(dicts) => dicts
            .into_iter()
            .filter_map(|dict| {
                dict.ip
                    .parse::<IpAddr>()
                    .ok()
                    .map(|ip| Peer { ip, port: dict.port })
            })
            .collect(),
    };

    let to_duration = |secs: Option<i64>| {
        secs.and_then(|s| u64::try_from(s).ok()).map(Duration::from_secs)
    };

    Ok(AnnounceResponse {
        interval: to_duration(raw.interval),
        min_interval: to_duration(raw.min_interval),
        tracker_id: raw.tracker_id,
        peers,
    })
}

/// Generates this client's 20-byte peer id: a fixed client prefix
/// followed by random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[PEER_ID_PREFIX.len()..]);
    peer_id
}

/// URL-encodes a byte slice according to RFC 3986.
///
/// Unreserved characters (a-z, A-Z, 0-9, -, ., _, ~) pass through;
/// everything else becomes `%XX`. Used for the raw 20-byte `info_hash`
/// and `peer_id` fields, which are binary rather than text.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}
